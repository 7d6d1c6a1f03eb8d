/// Diagnosis of incidents through reasoning provider backends
pub mod backends;
pub mod diagnoser;

pub use backends::{MockBackend, OllamaBackend, OpenAIBackend, ReasoningProvider};
pub use diagnoser::{format_prompt, Diagnoser, Diagnosis, IncidentContext};
