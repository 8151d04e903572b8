//! Bank-link lifecycle: create a requisition, wait for the user to come back
//! from the bank, then pull the first data.
//!
//! There is no push from the aggregator. The host tells us the user is back
//! (`resume`), possibly late, possibly never; an abandoned link simply stays
//! `AwaitingAuthentication` until a manual sync.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{Link, LinkStatus};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{BankError, Result};
use crate::gateway::{Aggregator, NewLinkRequest, RemoteLink};
use crate::institutions::InstitutionMap;
use crate::reconcile::{Reconciler, SyncSummary};
use crate::store::Storage;

/// Two-step wait after the return signal: sync after `first_delay`, and if
/// that brought no data, once more `retry_delay` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePolicy {
    pub first_delay: Duration,
    pub retry_delay: Duration,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_secs(3),
            retry_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStep {
    Wait(Duration),
    Sync,
    Settle,
}

impl ResumePolicy {
    /// Next step given time since the return signal, syncs already run, and
    /// whether the last one brought new data.
    pub fn step(&self, elapsed: Duration, attempts_done: u32, last_had_data: bool) -> ResumeStep {
        let due = match attempts_done {
            0 => self.first_delay,
            1 if !last_had_data => self.first_delay + self.retry_delay,
            _ => return ResumeStep::Settle,
        };
        if elapsed < due {
            ResumeStep::Wait(due - elapsed)
        } else {
            ResumeStep::Sync
        }
    }
}

/// Returned by `start`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStart {
    pub link_id: String,
    pub reference: String,
    pub redirect_url: String,
}

/// How the return from the bank played out
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// Linked and the first data arrived
    Linked(SyncSummary),
    /// Linked, but the bank has not delivered data yet. Still a success.
    LinkedAwaitingData(SyncSummary),
    /// The user has not finished at the bank yet
    StillAwaiting,
    NoPendingLinks,
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Where the bank sends the user after authentication
    pub redirect_url: String,
    pub language: String,
    pub policy: ResumePolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            redirect_url: "tally://bank-return".to_string(),
            language: "EN".to_string(),
            policy: ResumePolicy::default(),
        }
    }
}

pub struct LinkMachine {
    aggregator: Arc<dyn Aggregator>,
    store: Arc<dyn Storage>,
    reconciler: Arc<Reconciler>,
    institutions: InstitutionMap,
    clock: Arc<dyn Clock>,
    settings: LinkSettings,
}

impl LinkMachine {
    pub fn new(
        aggregator: Arc<dyn Aggregator>,
        store: Arc<dyn Storage>,
        reconciler: Arc<Reconciler>,
        institutions: InstitutionMap,
        clock: Arc<dyn Clock>,
        settings: LinkSettings,
    ) -> Self {
        Self {
            aggregator,
            store,
            reconciler,
            institutions,
            clock,
            settings,
        }
    }

    pub fn institutions(&self) -> &InstitutionMap {
        &self.institutions
    }

    /// Create a requisition and record it as pending return before handing
    /// out the redirect URL.
    ///
    /// With a `reference` that already names a live link of this user
    /// (locally, or upstream after a lost local record) that link is returned
    /// instead of creating another. A reference held by a finished link or by
    /// another user is `InvalidInput`.
    pub async fn start(&self, user_id: &str, institution: &str, reference: Option<&str>) -> Result<LinkStart> {
        let institution_id = self.institutions.resolve(institution)?.to_string();

        if let Some(reference) = reference {
            match self.lookup_reference(user_id, reference).await? {
                ReferenceLookup::Found(existing) if !existing.status.is_terminal() => {
                    info!(user = user_id, link = %existing.link_id, reference, "reusing in-flight link");
                    return Ok(LinkStart {
                        link_id: existing.link_id,
                        reference: existing.reference,
                        redirect_url: existing.redirect_url,
                    });
                }
                ReferenceLookup::Found(existing) => {
                    return Err(BankError::InvalidInput(format!(
                        "reference {reference} belongs to finished link {}",
                        existing.link_id
                    )));
                }
                ReferenceLookup::OtherUser => {
                    return Err(BankError::InvalidInput(format!("reference {reference} is already in use")));
                }
                ReferenceLookup::Missing => {}
            }
        }

        let now = self.clock.now();
        let reference = match reference {
            Some(r) => r.to_string(),
            None => format!("{user_id}-{}-{}", institution.to_lowercase(), now.timestamp_millis()),
        };
        let remote = self
            .aggregator
            .create_link(&NewLinkRequest {
                redirect_url: self.settings.redirect_url.clone(),
                institution_id,
                reference: reference.clone(),
                language: self.settings.language.clone(),
            })
            .await?;

        let link = Link {
            link_id: remote.id.clone(),
            user_id: user_id.to_string(),
            institution_id: remote.institution_id.clone(),
            reference,
            // The redirect is about to be opened; the return signal is all we get.
            status: LinkStatus::AwaitingAuthentication,
            accounts: Vec::new(),
            redirect_url: remote.link.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.save_link(&link).await?;
        info!(user = user_id, link = %link.link_id, institution = %link.institution_id, "link created");

        Ok(LinkStart {
            link_id: link.link_id,
            reference: link.reference,
            redirect_url: link.redirect_url,
        })
    }

    /// Local record first, then a scan of upstream links. An upstream hit is
    /// adopted into local storage for `user_id` unless another user owns it.
    pub async fn find_by_reference(&self, user_id: &str, reference: &str) -> Result<Option<Link>> {
        match self.lookup_reference(user_id, reference).await? {
            ReferenceLookup::Found(link) => Ok(Some(link)),
            ReferenceLookup::OtherUser | ReferenceLookup::Missing => Ok(None),
        }
    }

    async fn lookup_reference(&self, user_id: &str, reference: &str) -> Result<ReferenceLookup> {
        if let Some(link) = self.store.find_link_by_reference(user_id, reference).await? {
            return Ok(ReferenceLookup::Found(link));
        }
        let Some(remote) = self.aggregator.find_link_by_reference(reference).await? else {
            return Ok(ReferenceLookup::Missing);
        };
        if let Some(known) = self.store.get_link(&remote.id).await? {
            if known.user_id != user_id {
                warn!(user = user_id, link = %known.link_id, reference, "reference belongs to another user");
                return Ok(ReferenceLookup::OtherUser);
            }
            return Ok(ReferenceLookup::Found(known));
        }
        let now = self.clock.now();
        let link = Link {
            link_id: remote.id.clone(),
            user_id: user_id.to_string(),
            institution_id: remote.institution_id.clone(),
            reference: remote.reference.clone(),
            status: remote.local_status(),
            accounts: remote.accounts.clone(),
            redirect_url: remote.link.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.save_link(&link).await?;
        info!(user = user_id, link = %link.link_id, reference, "adopted upstream link");
        Ok(ReferenceLookup::Found(link))
    }

    /// Re-read the status of every pending link from the aggregator and
    /// persist changes. Returns the user's links after the refresh.
    ///
    /// A link whose status cannot be read keeps its stored status; only
    /// `AuthFailure` ends the refresh.
    pub async fn refresh(&self, user_id: &str) -> Result<Vec<Link>> {
        let mut links = self.store.get_links(user_id).await?;
        for link in links.iter_mut().filter(|l| is_pending(l.status)) {
            // The local link id is kept even when the reference fallback
            // finds the requisition under a new id.
            let remote = match self.fetch_remote(link).await {
                Ok(remote) => remote,
                Err(e @ BankError::AuthFailure(_)) => return Err(e),
                Err(e) => {
                    warn!(user = user_id, link = %link.link_id, error = %e, "link status check failed");
                    continue;
                }
            };
            let status = match remote.as_ref().map(RemoteLink::local_status) {
                // Handed out already; never step back to `Created`.
                Some(LinkStatus::Created) => LinkStatus::AwaitingAuthentication,
                Some(s) => s,
                None => LinkStatus::Error,
            };
            if status == link.status {
                continue;
            }
            info!(
                user = user_id,
                link = %link.link_id,
                from = link.status.as_str(),
                to = status.as_str(),
                "link status changed"
            );
            link.status = status;
            if let (LinkStatus::Linked, Some(r)) = (status, remote) {
                link.accounts = r.accounts;
            }
            link.updated_at = self.clock.now();
            self.store.save_link(link).await?;
        }
        Ok(links)
    }

    /// By id, then by reference when the id is gone upstream. `None` when
    /// neither finds it.
    async fn fetch_remote(&self, link: &Link) -> Result<Option<RemoteLink>> {
        match self.aggregator.get_link(&link.link_id).await {
            Ok(remote) => Ok(Some(remote)),
            Err(BankError::Upstream { status: 404, .. }) => {
                warn!(link = %link.link_id, reference = %link.reference, "link id unknown upstream, trying reference");
                self.aggregator.find_link_by_reference(&link.reference).await
            }
            Err(e) => Err(e),
        }
    }

    /// Handle the user coming back from the bank.
    ///
    /// Pending links that the bank now reports as expired or failed end the
    /// resume with `LinkExpired`/`LinkError` when nothing else got linked.
    pub async fn resume(&self, user_id: &str) -> Result<ResumeOutcome> {
        let before = self.store.get_links(user_id).await?;
        let pending: Vec<String> = before
            .iter()
            .filter(|l| is_pending(l.status))
            .map(|l| l.reference.clone())
            .collect();
        if pending.is_empty() {
            return Ok(ResumeOutcome::NoPendingLinks);
        }

        let after = self.refresh(user_id).await?;
        let touched: Vec<&Link> = after.iter().filter(|l| pending.contains(&l.reference)).collect();

        if !touched.iter().any(|l| l.status == LinkStatus::Linked) {
            if touched.iter().any(|l| is_pending(l.status)) {
                return Ok(ResumeOutcome::StillAwaiting);
            }
            return Err(match touched.first() {
                Some(l) if l.status == LinkStatus::Expired => BankError::LinkExpired(l.link_id.clone()),
                Some(l) => BankError::LinkError(l.link_id.clone()),
                None => BankError::UnknownLink(user_id.to_string()),
            });
        }

        self.settle(user_id).await
    }

    async fn settle(&self, user_id: &str) -> Result<ResumeOutcome> {
        let policy = self.settings.policy;
        let started = tokio::time::Instant::now();
        let mut attempts = 0;
        let mut last: Option<SyncSummary> = None;
        loop {
            let had_data = last.as_ref().is_some_and(SyncSummary::has_new_data);
            match policy.step(started.elapsed(), attempts, had_data) {
                ResumeStep::Wait(d) => tokio::time::sleep(d).await,
                ResumeStep::Sync => {
                    let summary = self.reconciler.sync(user_id).await?;
                    attempts += 1;
                    if !summary.has_new_data() {
                        info!(user = user_id, attempt = attempts, "no data from bank yet");
                    }
                    last = Some(summary);
                }
                ResumeStep::Settle => break,
            }
        }
        let summary = last.unwrap_or_default();
        info!(
            user = user_id,
            attempts,
            new_transactions = summary.new_transactions,
            "link resume settled"
        );
        Ok(if summary.has_new_data() {
            ResumeOutcome::Linked(summary)
        } else {
            ResumeOutcome::LinkedAwaitingData(summary)
        })
    }
}

enum ReferenceLookup {
    Found(Link),
    OtherUser,
    Missing,
}

fn is_pending(status: LinkStatus) -> bool {
    matches!(status, LinkStatus::Created | LinkStatus::AwaitingAuthentication)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ResumePolicy {
        ResumePolicy {
            first_delay: Duration::from_secs(3),
            retry_delay: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_waits_for_first_delay() {
        assert_eq!(policy().step(Duration::ZERO, 0, false), ResumeStep::Wait(Duration::from_secs(3)));
        assert_eq!(
            policy().step(Duration::from_secs(1), 0, false),
            ResumeStep::Wait(Duration::from_secs(2))
        );
        assert_eq!(policy().step(Duration::from_secs(3), 0, false), ResumeStep::Sync);
    }

    #[test]
    fn test_settles_after_first_sync_with_data() {
        assert_eq!(policy().step(Duration::from_secs(4), 1, true), ResumeStep::Settle);
    }

    #[test]
    fn test_retries_once_when_first_sync_was_empty() {
        assert_eq!(
            policy().step(Duration::from_secs(4), 1, false),
            ResumeStep::Wait(Duration::from_secs(9))
        );
        assert_eq!(policy().step(Duration::from_secs(13), 1, false), ResumeStep::Sync);
        assert_eq!(policy().step(Duration::from_secs(14), 2, false), ResumeStep::Settle);
    }

    #[test]
    fn test_late_return_syncs_immediately() {
        assert_eq!(policy().step(Duration::from_secs(600), 0, false), ResumeStep::Sync);
        assert_eq!(policy().step(Duration::from_secs(600), 1, false), ResumeStep::Sync);
    }
}
