use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast::error::TryRecvError;

use coffre_collections::account::Account;
use coffre_collections::mail::mailbox::{FlagOp, Mailbox, MailboxEvent, Status, Summary};
use coffre_collections::mail::mime::{BodyStructure, Section};
use coffre_collections::mail::namespace::MailboxRecord;
use coffre_collections::mail::query::{FetchedMessage, FetchedSection, QueryScope};
use coffre_collections::mail::record::SEEN;
use coffre_collections::mail::search::SearchKey;
use coffre_collections::mail::sequence::{SeqOrUid, Sequence, SequenceSet};
use coffre_collections::mail::uidindex::{Flag, ImapUid, ImapUidvalidity};
use coffre_collections::Error as EngineError;

use crate::imap::flow::{self, MailboxPerm, Selected, State, Transition};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Flow(#[from] flow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One client session on the account: the protocol verbs, once decoded,
/// each map to one method here.
pub struct Session {
    account: Arc<Account>,
    state: State,
}

impl Session {
    pub fn new(account: Arc<Account>) -> Self {
        Self {
            account,
            state: State::NotAuthenticated,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    // ---- any state ----

    /// Sends back what happened to the selected mailbox since the last call.
    pub async fn noop(&mut self) -> Result<Vec<MailboxEvent>> {
        let selected = match &mut self.state {
            State::Selected(selected) => selected,
            _ => return Ok(vec![]),
        };

        let mut events = vec![];
        let mut lagged = false;
        loop {
            match selected.events.try_recv() {
                Ok(evt) => events.push(evt),
                Err(TryRecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "session fell behind its mailbox events");
                    lagged = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if lagged {
            // what was missed is unknown, at least resync the message count
            let mailbox = selected.mailbox.clone();
            events.push(MailboxEvent::Exists(mailbox.status().await?.messages));
        }
        Ok(events)
    }

    pub fn logout(&mut self) -> Result<()> {
        self.state.apply(Transition::Logout)?;
        Ok(())
    }

    // ---- not authenticated ----

    /// Opens the session for `user_id`, who must own the account.
    pub fn authenticate(&mut self, user_id: &str) -> Result<()> {
        if !matches!(self.state, State::NotAuthenticated) {
            return Err(flow::Error::ForbiddenTransition.into());
        }
        if user_id != self.account.user_id {
            tracing::info!(claimed = user_id, "authentication rejected");
            return Err(EngineError::AuthenticationRejected.into());
        }
        self.state.apply(Transition::Authenticate)?;
        tracing::info!(user = %self.account.user_id, "session authenticated");
        Ok(())
    }

    // ---- authenticated ----

    pub async fn select(&mut self, path: &str) -> Result<Summary> {
        self.open(path, MailboxPerm::ReadWrite).await
    }

    pub async fn examine(&mut self, path: &str) -> Result<Summary> {
        self.open(path, MailboxPerm::ReadOnly).await
    }

    async fn open(&mut self, path: &str, perm: MailboxPerm) -> Result<Summary> {
        self.authenticated()?;
        let res = self.open_selection(path, perm).await;
        match res {
            Ok((selected, summary)) => {
                self.state.apply(Transition::Select(selected))?;
                Ok(summary)
            }
            Err(e) => {
                // a failed selection leaves nothing selected
                if let State::Selected(_) = self.state {
                    self.state.apply(Transition::Unselect)?;
                }
                Err(e)
            }
        }
    }

    async fn open_selection(&self, path: &str, perm: MailboxPerm) -> Result<(Selected, Summary)> {
        let mailbox = self.account.open_mailbox(path).await?;
        let selected = Selected::new(mailbox.clone(), perm);
        let summary = mailbox.summary().await?;
        if perm == MailboxPerm::ReadWrite {
            mailbox.clear_recent().await?;
        }
        tracing::debug!(mailbox = path, exists = summary.exists, perm = ?perm, "mailbox selected");
        Ok((selected, summary))
    }

    pub async fn create(&self, path: &str) -> Result<()> {
        self.authenticated()?;
        self.account.create(path).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.authenticated()?;
        Ok(self.account.delete(path).await?)
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.authenticated()?;
        Ok(self.account.rename(from, to).await?)
    }

    pub async fn list(&self, reference: &str, pattern: &str) -> Result<Vec<MailboxRecord>> {
        self.authenticated()?;
        Ok(self.account.list(reference, pattern).await?)
    }

    pub async fn lsub(&self, reference: &str, pattern: &str) -> Result<Vec<MailboxRecord>> {
        self.authenticated()?;
        Ok(self.account.lsub(reference, pattern).await?)
    }

    pub async fn subscribe(&self, path: &str) -> Result<()> {
        self.authenticated()?;
        Ok(self.account.subscribe(path).await?)
    }

    pub async fn unsubscribe(&self, path: &str) -> Result<()> {
        self.authenticated()?;
        Ok(self.account.unsubscribe(path).await?)
    }

    pub async fn status(&self, path: &str) -> Result<Status> {
        self.authenticated()?;
        Ok(self.account.status(path).await?)
    }

    pub async fn append(
        &self,
        path: &str,
        content: Vec<u8>,
        flags: Vec<Flag>,
        internal_date: Option<u64>,
    ) -> Result<(ImapUidvalidity, ImapUid)> {
        self.authenticated()?;
        let mailbox = self.account.open_mailbox(path).await?;
        Ok(mailbox.append(content, flags, internal_date).await?)
    }

    // ---- selected ----

    pub fn unselect(&mut self) -> Result<()> {
        self.selected()?;
        self.state.apply(Transition::Unselect)?;
        Ok(())
    }

    /// Unselects, removing the `\Deleted` messages first unless the mailbox
    /// was examined. The session is not told about the removals.
    pub async fn close(&mut self) -> Result<()> {
        let (mailbox, perm) = self.selected()?;
        if perm == MailboxPerm::ReadWrite {
            mailbox.expunge().await?;
        }
        self.state.apply(Transition::Unselect)?;
        Ok(())
    }

    pub async fn fetch(
        &self,
        sequence_set: &SequenceSet,
        by_uid: bool,
        scope: QueryScope,
    ) -> Result<Vec<FetchedMessage>> {
        let (mailbox, _) = self.selected()?;
        Ok(mailbox.fetch(sequence_set, by_uid, scope).await?)
    }

    /// One section of each designated message. Unless `peek`, the messages
    /// read are marked `\Seen` when the mailbox was selected.
    pub async fn fetch_section(
        &self,
        sequence_set: &SequenceSet,
        by_uid: bool,
        section: &Section,
        peek: bool,
    ) -> Result<Vec<FetchedSection>> {
        let (mailbox, perm) = self.selected()?;
        let sections = mailbox.fetch_section(sequence_set, by_uid, section).await?;
        if !peek && perm == MailboxPerm::ReadWrite && !sections.is_empty() {
            let read = SequenceSet(
                sections
                    .iter()
                    .map(|s| Sequence::Single(SeqOrUid::Value(s.uid)))
                    .collect(),
            );
            mailbox
                .set_flags(&read, true, FlagOp::Add, vec![SEEN.into()], false)
                .await?;
        }
        Ok(sections)
    }

    pub async fn body_structure(
        &self,
        sequence_set: &SequenceSet,
        by_uid: bool,
    ) -> Result<Vec<(ImapUid, BodyStructure)>> {
        let (mailbox, _) = self.selected()?;
        Ok(mailbox.body_structure(sequence_set, by_uid).await?)
    }

    pub async fn search(&self, key: &SearchKey, by_uid: bool) -> Result<Vec<u32>> {
        let (mailbox, _) = self.selected()?;
        Ok(mailbox.search(key, by_uid).await?)
    }

    pub async fn store(
        &self,
        sequence_set: &SequenceSet,
        by_uid: bool,
        op: FlagOp,
        flags: Vec<Flag>,
        silent: bool,
    ) -> Result<Vec<(ImapUid, Vec<Flag>)>> {
        let mailbox = self.writable()?;
        Ok(mailbox
            .set_flags(sequence_set, by_uid, op, flags, silent)
            .await?)
    }

    /// Allowed on an examined mailbox: only the destination is written.
    pub async fn copy(
        &self,
        sequence_set: &SequenceSet,
        by_uid: bool,
        dest: &str,
    ) -> Result<Vec<(ImapUid, ImapUid)>> {
        let (mailbox, _) = self.selected()?;
        let dest = self.account.open_mailbox(dest).await?;
        Ok(mailbox.copy_to(sequence_set, by_uid, &dest).await?)
    }

    pub async fn r#move(
        &self,
        sequence_set: &SequenceSet,
        by_uid: bool,
        dest: &str,
    ) -> Result<Vec<(ImapUid, ImapUid)>> {
        let mailbox = self.writable()?;
        let dest = self.account.open_mailbox(dest).await?;
        Ok(mailbox.move_to(sequence_set, by_uid, &dest).await?)
    }

    pub async fn expunge(&self) -> Result<Vec<ImapUid>> {
        let mailbox = self.writable()?;
        Ok(mailbox.expunge().await?)
    }

    // ---- state checks ----

    fn authenticated(&self) -> Result<()> {
        match self.state.is_authenticated() {
            true => Ok(()),
            false => Err(EngineError::NotAuthenticated.into()),
        }
    }

    fn selected(&self) -> Result<(Arc<Mailbox>, MailboxPerm)> {
        match &self.state {
            State::Selected(s) => Ok((s.mailbox.clone(), s.perm)),
            State::Authenticated => Err(EngineError::NoMailboxSelected.into()),
            _ => Err(EngineError::NotAuthenticated.into()),
        }
    }

    fn writable(&self) -> Result<Arc<Mailbox>> {
        match self.selected()? {
            (mailbox, MailboxPerm::ReadWrite) => Ok(mailbox),
            (_, MailboxPerm::ReadOnly) => Err(EngineError::ReadOnly.into()),
        }
    }
}
