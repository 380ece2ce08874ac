//! Per-session client state.
//!
//! One [`Session`] exists per connected session, owned exclusively by the
//! runtime task. Pending attachments are updated optimistically on send and
//! delete, but any server-pushed list overwrites local state — the server
//! always wins, which keeps client and server from drifting apart.

use cutline_types::{MediaMeta, SessionLimits, SessionSnapshot};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub lang: String,
    pub limits: SessionLimits,
    pending: Vec<MediaMeta>,
}

impl Session {
    /// Builds session state from a snapshot. `preferred_lang` wins over the
    /// snapshot when the user has an explicit language preference stored.
    pub fn from_snapshot(snapshot: &SessionSnapshot, preferred_lang: Option<&str>) -> Self {
        let lang = preferred_lang
            .map(str::to_string)
            .or_else(|| snapshot.lang.clone())
            .unwrap_or_else(|| "en".to_string());
        Self {
            id: snapshot.session_id.clone(),
            lang,
            limits: snapshot.limits.clone(),
            pending: snapshot.pending_media.clone(),
        }
    }

    /// Applies a server snapshot push. Server state is authoritative for
    /// limits and the pending list; lang is only adopted when present.
    pub fn apply_snapshot(&mut self, snapshot: &SessionSnapshot) {
        self.limits = snapshot.limits.clone();
        self.pending = snapshot.pending_media.clone();
        if let Some(lang) = &snapshot.lang {
            self.lang = lang.clone();
        }
    }

    /// Replaces the pending list with a server-pushed one.
    pub fn set_pending(&mut self, pending: Vec<MediaMeta>) {
        self.pending = pending;
    }

    pub fn pending(&self) -> &[MediaMeta] {
        &self.pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Room left under the pending-attachment cap.
    pub fn pending_remaining(&self) -> usize {
        let max = self.limits.max_pending_media_per_session as usize;
        max.saturating_sub(self.pending.len())
    }

    /// Clears the pending list for an outgoing message, returning the
    /// attachments that ride along with it.
    pub fn take_pending(&mut self) -> Vec<MediaMeta> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(id: &str) -> MediaMeta {
        MediaMeta {
            id: id.to_string(),
            name: format!("{id}.mp4"),
            kind: "video".to_string(),
            thumb_url: None,
            file_url: None,
        }
    }

    fn snapshot(pending: Vec<MediaMeta>) -> SessionSnapshot {
        SessionSnapshot {
            session_id: "s1".to_string(),
            lang: Some("zh".to_string()),
            developer_mode: false,
            pending_media: pending,
            history: Vec::new(),
            limits: SessionLimits::default(),
        }
    }

    #[test]
    fn preferred_lang_wins_over_snapshot() {
        let session = Session::from_snapshot(&snapshot(vec![]), Some("en"));
        assert_eq!(session.lang, "en");

        let session = Session::from_snapshot(&snapshot(vec![]), None);
        assert_eq!(session.lang, "zh");
    }

    #[test]
    fn server_snapshot_overwrites_local_pending() {
        let mut session = Session::from_snapshot(&snapshot(vec![media("a")]), None);
        session.set_pending(vec![media("local")]);

        session.apply_snapshot(&snapshot(vec![media("b"), media("c")]));
        let ids: Vec<&str> = session.pending().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);
    }

    #[test]
    fn take_pending_clears_the_list() {
        let mut session = Session::from_snapshot(&snapshot(vec![media("a"), media("b")]), None);
        let taken = session.take_pending();
        assert_eq!(taken.len(), 2);
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.pending_remaining(), 30);
    }
}
