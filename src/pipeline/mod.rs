pub mod analysis;
pub mod figures;
pub mod history;
pub mod media;
pub mod orchestrator;
pub mod transcription;
pub mod user_state;
