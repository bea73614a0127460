pub mod remote;
pub mod sync;
pub mod transfer;

pub use remote::{RemoteClient, RemoteListing, RemoteTagInfo, StageOutcome};
pub use sync::{PullReport, PushReport, SyncClient};
pub use transfer::{download_file, upload_file, TransferStats};
