//! Write-Ahead Log Port
//!
//! The primary region's durable, ordered edit log.

use crate::domain::entities::{Mutation, WalEdit};
use crate::domain::errors::WalReadError;
use crate::domain::value_objects::SequenceId;
use tokio::sync::watch;

/// Per-region write-ahead log.
///
/// Sequence ids are assigned by `append`, strictly increasing and gap-free.
/// An edit only becomes visible to readers once `sync` has moved the durable
/// watermark past it.
pub trait WriteAheadLog: Send + Sync {
    /// Append an edit and return its sequence id. Not yet durable.
    fn append(&self, mutations: Vec<Mutation>) -> SequenceId;

    /// Make every appended edit durable and return the new watermark.
    fn sync(&self) -> SequenceId;

    /// Highest durable sequence id.
    fn durable_sequence(&self) -> SequenceId;

    /// Watch the durable watermark.
    fn watch_durable(&self) -> watch::Receiver<SequenceId>;

    /// Up to `max` durable edits with sequence id greater than `after`, in order.
    ///
    /// Reads transparently cross from archived segments into the active one.
    fn read_durable(&self, after: SequenceId, max: usize) -> Result<Vec<WalEdit>, WalReadError>;

    /// Close the active segment and move it to the archive.
    fn roll(&self);

    /// Drop archived segments whose edits are all `<= through`.
    ///
    /// Returns the number of segments removed.
    fn purge_archived_through(&self, through: SequenceId) -> usize;
}
