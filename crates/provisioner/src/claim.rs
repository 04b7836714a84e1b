//! The optimistic claim primitive.
//!
//! The directory offers no compare-and-swap, so claiming is write-then-
//! read-back: write our ownership label into the display name, read the
//! instance again, and check the label that survived is ours. Two racing
//! claimants both write; exactly one's label is the last write, and the
//! other observes the collision here and moves on to a different candidate.

use cloud_api::{DirectoryError, InstanceDirectory};
use tracing::debug;

use crate::label::{Label, NodeLabel};

/// The result of one claim attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ClaimOutcome {
    /// Our label survived the read-back; the instance is ours.
    Won,
    /// Another writer got there between our write and read-back.
    Lost,
}

pub(crate) async fn claim_instance<D: InstanceDirectory + ?Sized>(
    directory: &D,
    instance_id: i64,
    label: &NodeLabel,
) -> Result<ClaimOutcome, DirectoryError> {
    let encoded = Label::Claimed(label.clone()).encode();
    match directory.set_display_name(instance_id, &encoded).await {
        Ok(()) => {}
        // A conflicting write reported by the provider is a lost race, not
        // a failure of the claim protocol.
        Err(DirectoryError::Conflict { .. }) => {
            debug!(instance_id, "display name write conflicted, claim lost");
            return Ok(ClaimOutcome::Lost);
        }
        Err(e) => return Err(e),
    }

    let observed = directory.get_instance(instance_id).await?;
    if Label::decode(&observed.display_name) == Label::Claimed(label.clone()) {
        Ok(ClaimOutcome::Won)
    } else {
        debug!(
            instance_id,
            display_name = %observed.display_name,
            "read-back shows another claimant won"
        );
        Ok(ClaimOutcome::Lost)
    }
}
