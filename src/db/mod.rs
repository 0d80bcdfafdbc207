mod schema;
mod store;

pub use store::{CaptureRecord, CaptureStore, OutboxEntry, UploadStatus};
