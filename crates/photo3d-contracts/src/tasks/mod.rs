mod download;
mod formats;
mod status;

pub use download::{DownloadFile, DownloadResult};
pub use formats::{format_from_url, sniff_format, ModelFormat};
pub use status::{GenerationTask, SubmittedTask, TaskStatus, TaskStatusResult};
