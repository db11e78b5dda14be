//! Annotation service abstraction and adapters.

mod matcher;
mod openai;
mod prompt;
mod request_log;
mod types;

pub use matcher::match_glosses;
pub use openai::OpenAiAnnotationClient;
pub use prompt::normalize_user_prompt;
pub use types::{AnnotationClient, AnnotationRequest, AnnotationResult, Gloss, ServiceError};
