//! 领域层

pub mod model;

pub use model::{
    CanonicalType, DecodedMessage, DestinationInfo, GROUP_SUFFIX, RawRecord,
    is_group_destination, sort_by_recency,
};
