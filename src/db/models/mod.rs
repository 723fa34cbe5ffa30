mod transfer;
mod watermark;

pub use transfer::{EventSource, RecordId, TransferRecord};
pub use watermark::{Watermark, WatermarkKey};
