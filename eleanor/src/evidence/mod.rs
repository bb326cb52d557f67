pub mod custody;
pub mod service;
pub mod store;

pub use custody::{CustodyAction, CustodyEvent, CustodyLog};
pub use service::{ActorContext, Evidence, EvidenceService, UploadRequest, VerifyResult};
pub use store::{ByteStream, FsObjectStore, HashTriplet, ObjectStore, StoreStats, UploadResult};
