//! Duplicate resolution for tastebase.
//!
//! Two tiers guard every write:
//! - **Tier 1** ([`lexical_similarity`]): free name comparison after
//!   normalization; pairs below the prefilter threshold stop here.
//! - **Tier 2** ([`Adjudicator`]): an external arbiter judges the survivors,
//!   behind a geographic guard.
//!
//! Pending discoveries skip both tiers and use exact identity keys with
//! alias resolution ([`AliasTable`]).

pub mod adjudicate;
pub mod identity;
pub mod lexical;
pub mod normalize;
pub mod resolver;

pub use adjudicate::{
    Adjudicator, CandidateRecord, Decision, DuplicateCandidatePair, geographically_distinct,
};
pub use identity::{AliasTable, discovery_identity};
pub use lexical::lexical_similarity;
pub use normalize::{identity_key, normalize_name, normalize_place};
pub use resolver::{DuplicateCheck, DuplicateResolver, EntityKind};
