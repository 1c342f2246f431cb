pub mod authorizer;

pub use authorizer::{AuthorizationDecision, FixTargetAuthorizer};
