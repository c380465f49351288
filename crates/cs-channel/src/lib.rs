//! Channel-manager integration: the paced REST client, raw record access,
//! webhook envelopes and the mapper from raw records to canonical patches.

pub mod client;
pub mod envelope;
pub mod error;
pub mod mapper;
pub mod raw;

pub use client::{ChannelApi, ChannelClient, CollectionResult, DateFilter, Page, PageFailure};
pub use envelope::WebhookEnvelope;
pub use error::{ChannelError, Result};
pub use mapper::{classify_channel, MappedEntity, Mapper, MappingError, StatusTable};
pub use raw::{RawRecord, Resource};
