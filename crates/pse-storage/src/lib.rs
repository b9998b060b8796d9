//! Raw payload archive, paced HTTP fetching and Delta Lake tables.

pub mod archive;
pub mod http;
pub mod lake;

pub use archive::{ArchivedPayload, ArtifactStore};
pub use http::{
    is_transient_status, BackoffPolicy, FetchError, FetchRequest, FetchedResponse, HttpClientConfig, HttpFetcher,
    RateLimit, RequestBody,
};
pub use lake::{LakeError, LakeTable, MergeOutcome, GCS_SERVICE_ACCOUNT_PATH};
