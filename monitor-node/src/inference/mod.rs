pub mod mcp;
pub mod question;
pub mod scheduler;
pub mod vlm;

pub use question::QuestionRegistry;
pub use scheduler::InferenceScheduler;
pub use vlm::VlmClient;
