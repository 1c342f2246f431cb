pub mod cache;
pub mod masker;
pub mod store;

pub use cache::{InMemoryKeyValueStore, KeyValueStore, TtlCache, TwoTierCache};
pub use masker::{mask_observations, MaskingOutcome, MaskingPolicy, MaskingStats, MASKED_PLACEHOLDER};
pub use store::{ConversationStore, InMemoryConversationStore, JsonlConversationStore, StoreError};
