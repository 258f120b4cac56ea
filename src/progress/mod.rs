//! Progress Module
//!
//! Long-running node operations (backup, restore) report progress over their
//! own channel, one stage at a time. Each kind gets one synchronizer that
//! merges those single-stage deltas into a two-field record in the cache.
//!
//! | Module         | Responsibility                                    |
//! |----------------|---------------------------------------------------|
//! | `record`       | Operation kinds, stage updates, progress records  |
//! | `synchronizer` | Channel subscription and merge into the cache     |

mod record;
mod synchronizer;

pub use record::{
    OperationKind, ProgressRecord, ProgressSnapshot, ProgressUpdate, Stage, STAGE_COMPLETE,
};
pub use synchronizer::ProgressSynchronizer;
