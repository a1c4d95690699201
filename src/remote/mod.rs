//! Wire operations against a remote cluster: request execution, bearer
//! authorization, the blob transfer protocol and metadata-plane calls.

pub mod auth;
pub mod blob;
pub mod executor;
pub mod metadata;

pub use auth::AuthorizationResolver;
pub use blob::{BlobPayload, BlobTransfer, PushOutcome};
pub use executor::{Outcome, RequestExecutor, RequestSpec};
pub use metadata::MetadataClient;
