//! History reconciliation
//!
//! Turns "the mailbox moved from cursor A to B" into the list of messages
//! added in between, falling back to a bounded resync when Gmail no longer
//! has history for A.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};

use crate::gmail::api::GmailMessage;
use crate::gmail::{GmailError, MailService, MessageFormat};
use crate::models::parse_history_id;
use crate::transport::Cancellation;

/// Default cap on history pages per reconciliation
pub const DEFAULT_MAX_HISTORY_PAGES: usize = 10;

/// Messages listed when the cursor has expired
pub const RESYNC_MAX_MESSAGES: usize = 25;

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub max_history_pages: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            max_history_pages: DEFAULT_MAX_HISTORY_PAGES,
        }
    }
}

/// Messages added since the old cursor
#[derive(Debug, Clone, Default)]
pub struct Delta {
    /// Fetched messages, in first-seen order
    pub messages: Vec<GmailMessage>,
    /// Cursor to persist once the delta is handled
    pub history_id: u64,
    /// The messages came from a recent-message listing, not a precise diff
    pub resync: bool,
    /// Label id to name, empty when no messages or labels are unavailable
    pub label_names: HashMap<String, String>,
}

/// Outcome of a reconciliation
#[derive(Debug, Clone)]
pub enum Reconciliation {
    /// The push carried a cursor at or behind the stored one
    NoNewMessages,
    Changes(Delta),
}

/// Diffs mailbox history through a [`MailService`]
pub struct HistoryReconciler<M> {
    mail: M,
    options: ReconcileOptions,
}

impl<M: MailService> HistoryReconciler<M> {
    pub fn new(mail: M) -> Self {
        Self {
            mail,
            options: ReconcileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    /// Collect messages added after `old_cursor`
    ///
    /// `hint` is the cursor carried by the push. Errors leave the caller's
    /// cursor untouched so the next push retries the same range.
    pub fn reconcile(
        &self,
        old_cursor: u64,
        hint: &str,
        include_body: bool,
        cancel: &Cancellation,
    ) -> Result<Reconciliation, GmailError> {
        let hint = parse_history_id(hint);
        if hint.is_some_and(|h| h <= old_cursor) {
            debug!("Push cursor {hint:?} not ahead of {old_cursor}; nothing to do");
            return Ok(Reconciliation::NoNewMessages);
        }

        let (ids, history_id, resync) = match self.list_added(old_cursor, cancel) {
            Ok((ids, history_id)) => (ids, history_id, false),
            Err(GmailError::HistoryExpired) => {
                warn!("History from {old_cursor} has expired; resyncing recent messages");
                let ids = self
                    .mail
                    .list_recent_message_ids(RESYNC_MAX_MESSAGES, cancel)?;
                (ids, hint.unwrap_or(old_cursor), true)
            }
            Err(err) => return Err(err),
        };

        let format = if include_body {
            MessageFormat::Full
        } else {
            MessageFormat::Metadata
        };
        let mut seen = HashSet::new();
        let mut messages = Vec::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            messages.push(self.mail.get_message(&id, format, cancel)?);
        }

        let label_names = if messages.is_empty() {
            HashMap::new()
        } else {
            self.label_names(cancel)
        };

        info!(
            "Reconciled {} message(s) from {} to {}{}",
            messages.len(),
            old_cursor,
            history_id,
            if resync { " (resync)" } else { "" }
        );
        Ok(Reconciliation::Changes(Delta {
            messages,
            history_id,
            resync,
            label_names,
        }))
    }

    /// Page through `messageAdded` history
    ///
    /// Returns the added ids and the cursor reported by the last page, or
    /// `old_cursor` when that is missing or unparseable.
    fn list_added(&self, old_cursor: u64, cancel: &Cancellation) -> Result<(Vec<String>, u64), GmailError> {
        let mut ids = Vec::new();
        let mut history_id = old_cursor;
        let mut page_token: Option<String> = None;

        for page in 0..self.options.max_history_pages.max(1) {
            let response = self
                .mail
                .list_history(old_cursor, page_token.as_deref(), cancel)?;

            history_id = response
                .history_id
                .as_deref()
                .and_then(parse_history_id)
                .unwrap_or(old_cursor);

            ids.extend(
                response
                    .history
                    .into_iter()
                    .flatten()
                    .flat_map(|record| record.messages_added.into_iter().flatten())
                    .map(|added| added.message.id),
            );

            match response.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
            if page + 1 == self.options.max_history_pages {
                warn!(
                    "Stopped after {} history pages; remaining changes wait for the next push",
                    self.options.max_history_pages
                );
            }
        }

        Ok((ids, history_id))
    }

    fn label_names(&self, cancel: &Cancellation) -> HashMap<String, String> {
        match self.mail.list_labels(cancel) {
            Ok(labels) => labels.into_iter().map(|l| (l.id, l.name)).collect(),
            Err(e) => {
                warn!("Failed to list labels, using label ids: {e}");
                HashMap::new()
            }
        }
    }
}
