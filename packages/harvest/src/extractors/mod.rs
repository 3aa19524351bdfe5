//! Ready-made [`Extractor`](crate::engine::Extractor) implementations.

mod contacts;
mod remote_job;

pub use contacts::{html_to_text, ContactDetails, ContactExtractor, JoinedContacts};
pub use remote_job::RemoteJobExtractor;
