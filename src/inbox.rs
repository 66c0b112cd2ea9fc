//! File-backed message inboxes.
//!
//! Each inbox is an append-only JSON-lines log at `<dir>/<inbox>.jsonl`
//! holding two kinds of record: messages and acks. A sibling
//! `<inbox>.lock` file is `flock`ed shared by producers and exclusively by
//! ack and prune, so producers never block each other.
//!
//! Delivery is at-least-once: a message stays pending until acked, and a
//! consumer that crashes before acking will see it again. Message IDs let
//! the consumer drop those repeats.

// Timestamps won't overflow u64 until year 584942417355
#![allow(clippy::cast_possible_truncation)]

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Attempts to take a contended inbox lock before giving up.
const LOCK_RETRIES: u32 = 50;
/// Pause between lock attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Errors that can occur during inbox operations.
#[derive(Debug, Error)]
pub enum InboxError {
    #[error("inbox I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode inbox record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("inbox {0} is locked by another process")]
    Locked(InboxId),

    #[error("message {id} not found in inbox {inbox}")]
    NotFound { inbox: InboxId, id: MessageId },
}

/// Filesystem-safe inbox name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InboxId(String);

impl InboxId {
    /// Derive an inbox ID from a session, team or fleet name.
    ///
    /// Anything outside `[A-Za-z0-9._-]` becomes `-`, and leading dots become
    /// `_` so the result can never be `.`, `..` or a hidden file.
    #[must_use]
    pub fn for_name(name: &str) -> Self {
        let mut id: String = name
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let dots = id.len() - id.trim_start_matches('.').len();
        id.replace_range(..dots, &"_".repeat(dots));
        if id.is_empty() {
            id.push('_');
        }
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// A fresh random ID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message waiting in an inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: MessageId,
    pub inbox: InboxId,
    pub payload: String,
    /// Unix timestamp in milliseconds.
    pub enqueued_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl InboxMessage {
    /// A new message with a fresh ID, stamped now.
    #[must_use]
    pub fn new(inbox: InboxId, payload: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            inbox,
            payload: payload.into(),
            enqueued_at: now_millis(),
            sender: None,
        }
    }

    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

/// One line of the inbox log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Message(InboxMessage),
    Ack { id: MessageId, acked_at: u64 },
}

/// Folded view of an inbox log.
#[derive(Debug, Default)]
struct Snapshot {
    /// Messages in enqueue order, first occurrence of each ID only.
    messages: Vec<InboxMessage>,
    acked: HashSet<MessageId>,
}

impl Snapshot {
    fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    fn pending(self) -> Vec<InboxMessage> {
        let acked = self.acked;
        self.messages
            .into_iter()
            .filter(|m| !acked.contains(&m.id))
            .collect()
    }
}

/// Pending messages returned by [`InboxQueue::poll`].
///
/// A point-in-time view; poll again to see newer messages.
#[derive(Debug)]
pub struct Pending {
    inner: std::vec::IntoIter<InboxMessage>,
}

impl Iterator for Pending {
    type Item = InboxMessage;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Pending {}

/// A directory of inboxes.
#[derive(Debug, Clone)]
pub struct InboxQueue {
    dir: PathBuf,
}

impl InboxQueue {
    /// Open (creating if needed) the inbox directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, InboxError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn log_path(&self, inbox: &InboxId) -> PathBuf {
        self.dir.join(format!("{inbox}.jsonl"))
    }

    fn lock_path(&self, inbox: &InboxId) -> PathBuf {
        self.dir.join(format!("{inbox}.lock"))
    }

    /// Enqueue a payload with a fresh ID.
    pub fn enqueue(
        &self,
        inbox: &InboxId,
        payload: impl Into<String>,
    ) -> Result<MessageId, InboxError> {
        self.enqueue_message(InboxMessage::new(inbox.clone(), payload))
    }

    /// Enqueue a fully-formed message.
    ///
    /// If a message with the same ID was already enqueued (pending or acked)
    /// nothing is written and the existing ID is returned.
    pub fn enqueue_message(&self, message: InboxMessage) -> Result<MessageId, InboxError> {
        let inbox = message.inbox.clone();
        let _lock = self.lock(&inbox, FlockArg::LockSharedNonblock)?;

        let snapshot = self.read_snapshot(&inbox)?;
        if snapshot.contains(&message.id) {
            debug!(%inbox, id = %message.id, "Duplicate message ignored");
            return Ok(message.id);
        }

        let id = message.id.clone();
        self.append(&inbox, &Record::Message(message))?;
        info!(%inbox, %id, "Enqueued message");
        Ok(id)
    }

    /// Messages that have not been acked, oldest first.
    pub fn poll(&self, inbox: &InboxId) -> Result<Pending, InboxError> {
        let _lock = self.lock(inbox, FlockArg::LockSharedNonblock)?;
        let pending = self.read_snapshot(inbox)?.pending();
        debug!(%inbox, count = pending.len(), "Polled inbox");
        Ok(Pending {
            inner: pending.into_iter(),
        })
    }

    /// Mark a message delivered. Acking twice is not an error.
    pub fn ack(&self, inbox: &InboxId, id: &MessageId) -> Result<(), InboxError> {
        let _lock = self.lock(inbox, FlockArg::LockExclusiveNonblock)?;

        let snapshot = self.read_snapshot(inbox)?;
        if !snapshot.contains(id) {
            return Err(InboxError::NotFound {
                inbox: inbox.clone(),
                id: id.clone(),
            });
        }
        if snapshot.acked.contains(id) {
            debug!(%inbox, %id, "Message already acked");
            return Ok(());
        }

        self.append(
            inbox,
            &Record::Ack {
                id: id.clone(),
                acked_at: now_millis(),
            },
        )?;
        info!(%inbox, %id, "Acked message");
        Ok(())
    }

    /// Drop acked messages and anything older than `max_age`.
    ///
    /// Returns the number of messages removed.
    pub fn prune(&self, inbox: &InboxId, max_age: Duration) -> Result<usize, InboxError> {
        let _lock = self.lock(inbox, FlockArg::LockExclusiveNonblock)?;

        let snapshot = self.read_snapshot(inbox)?;
        let total = snapshot.messages.len();
        let cutoff = now_millis().saturating_sub(max_age.as_millis() as u64);
        let kept: Vec<InboxMessage> = snapshot
            .pending()
            .into_iter()
            .filter(|m| m.enqueued_at >= cutoff)
            .collect();
        let removed = total - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut buf = Vec::new();
        for message in kept {
            encode_line(&mut buf, &Record::Message(message))?;
        }
        let path = self.log_path(inbox);
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;

        info!(%inbox, %removed, "Pruned inbox");
        Ok(removed)
    }

    /// IDs of every inbox in the directory.
    pub fn list(&self) -> Result<Vec<InboxId>, InboxError> {
        let mut ids: Vec<InboxId> = std::fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                name.strip_suffix(".jsonl").map(|stem| InboxId(stem.to_string()))
            })
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ids)
    }

    /// Take the per-inbox lock, retrying briefly on contention.
    fn lock(&self, inbox: &InboxId, arg: FlockArg) -> Result<Flock<File>, InboxError> {
        let path = self.lock_path(inbox);
        for attempt in 1..=LOCK_RETRIES {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            match Flock::lock(file, arg) {
                Ok(lock) => return Ok(lock),
                Err((_, Errno::EWOULDBLOCK)) => {
                    debug!(%inbox, %attempt, "Inbox lock contended");
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err((_, errno)) => return Err(InboxError::Io(errno.into())),
            }
        }
        warn!(%inbox, "Gave up waiting for inbox lock");
        Err(InboxError::Locked(inbox.clone()))
    }

    fn append(&self, inbox: &InboxId, record: &Record) -> Result<(), InboxError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(self.log_path(inbox))?;

        let mut buf = Vec::new();
        // A crash mid-append can leave a torn last line; start a fresh one
        if ends_without_newline(&mut file)? {
            buf.push(b'\n');
        }
        encode_line(&mut buf, record)?;

        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_snapshot(&self, inbox: &InboxId) -> Result<Snapshot, InboxError> {
        let file = match File::open(self.log_path(inbox)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Snapshot::default()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshot = Snapshot::default();
        let mut seen = HashSet::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(&line) {
                Ok(Record::Message(message)) => {
                    if seen.insert(message.id.clone()) {
                        snapshot.messages.push(message);
                    }
                }
                Ok(Record::Ack { id, .. }) => {
                    snapshot.acked.insert(id);
                }
                Err(e) => {
                    warn!(%inbox, line = lineno + 1, %e, "Skipping unreadable inbox record");
                }
            }
        }
        Ok(snapshot)
    }
}

fn encode_line(buf: &mut Vec<u8>, record: &Record) -> Result<(), InboxError> {
    serde_json::to_writer(&mut *buf, record).map_err(InboxError::Encode)?;
    buf.push(b'\n');
    Ok(())
}

fn ends_without_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (tempfile::TempDir, InboxQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = InboxQueue::open(dir.path().join("inbox")).unwrap();
        (dir, queue)
    }

    fn ids(pending: Pending) -> Vec<MessageId> {
        pending.map(|m| m.id).collect()
    }

    #[test]
    fn test_inbox_id_sanitizes_names() {
        assert_eq!(InboxId::for_name("feature/auth-flow").as_str(), "feature-auth-flow");
        assert_eq!(InboxId::for_name("team alpha").as_str(), "team-alpha");
        assert_eq!(InboxId::for_name("v1.2_fix").as_str(), "v1.2_fix");
        assert_eq!(InboxId::for_name("..").as_str(), "__");
        assert_eq!(InboxId::for_name(".hidden").as_str(), "_hidden");
        assert_eq!(InboxId::for_name("").as_str(), "_");
        assert_eq!(InboxId::for_name("ünï").as_str(), "-n-");
    }

    #[test]
    fn test_enqueue_then_poll_until_acked() {
        let (_dir, queue) = queue();
        let inbox = InboxId::for_name("fleet");

        let id = queue.enqueue(&inbox, "review PR 12").unwrap();
        assert_eq!(ids(queue.poll(&inbox).unwrap()), vec![id.clone()]);
        // Still there on a second poll
        assert_eq!(ids(queue.poll(&inbox).unwrap()), vec![id.clone()]);

        queue.ack(&inbox, &id).unwrap();
        assert!(ids(queue.poll(&inbox).unwrap()).is_empty());
        assert!(ids(queue.poll(&inbox).unwrap()).is_empty());
    }

    #[test]
    fn test_poll_preserves_enqueue_order() {
        let (_dir, queue) = queue();
        let inbox = InboxId::for_name("fleet");

        let a = queue.enqueue(&inbox, "a").unwrap();
        let b = queue.enqueue(&inbox, "b").unwrap();
        let c = queue.enqueue(&inbox, "c").unwrap();
        queue.ack(&inbox, &b).unwrap();

        let pending: Vec<_> = queue.poll(&inbox).unwrap().collect();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, a);
        assert_eq!(pending[0].payload, "a");
        assert_eq!(pending[1].id, c);
    }

    #[test]
    fn test_duplicate_id_is_delivered_once() {
        let (_dir, queue) = queue();
        let inbox = InboxId::for_name("fleet");

        let mut message = InboxMessage::new(inbox.clone(), "hello");
        message.id = MessageId::from("fixed-id");
        queue.enqueue_message(message.clone()).unwrap();
        queue.enqueue_message(message.clone()).unwrap();

        assert_eq!(queue.poll(&inbox).unwrap().len(), 1);

        // Re-delivery after ack does not resurrect it
        queue.ack(&inbox, &message.id).unwrap();
        queue.enqueue_message(message).unwrap();
        assert_eq!(queue.poll(&inbox).unwrap().len(), 0);
    }

    #[test]
    fn test_ack_unknown_message_is_not_found() {
        let (_dir, queue) = queue();
        let inbox = InboxId::for_name("fleet");
        queue.enqueue(&inbox, "x").unwrap();

        let err = queue.ack(&inbox, &MessageId::from("missing")).unwrap_err();
        assert!(matches!(err, InboxError::NotFound { .. }));
    }

    #[test]
    fn test_double_ack_is_ok() {
        let (_dir, queue) = queue();
        let inbox = InboxId::for_name("fleet");
        let id = queue.enqueue(&inbox, "x").unwrap();

        queue.ack(&inbox, &id).unwrap();
        queue.ack(&inbox, &id).unwrap();

        let log = std::fs::read_to_string(queue.log_path(&inbox)).unwrap();
        assert_eq!(log.matches("\"kind\":\"ack\"").count(), 1);
    }

    #[test]
    fn test_concurrent_consumers_ack_once() {
        let (_dir, queue) = queue();
        let inbox = InboxId::for_name("fleet");
        let id = queue.enqueue(&inbox, "claim me").unwrap();

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(6));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let queue = queue.clone();
                let inbox = inbox.clone();
                let id = id.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    queue.ack(&inbox, &id).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let log = std::fs::read_to_string(queue.log_path(&inbox)).unwrap();
        assert_eq!(log.matches("\"kind\":\"ack\"").count(), 1);
        assert!(ids(queue.poll(&inbox).unwrap()).is_empty());
    }

    #[test]
    fn test_inboxes_are_independent() {
        let (_dir, queue) = queue();
        let alpha = InboxId::for_name("alpha");
        let beta = InboxId::for_name("beta");

        queue.enqueue(&alpha, "for alpha").unwrap();
        assert_eq!(queue.poll(&alpha).unwrap().len(), 1);
        assert_eq!(queue.poll(&beta).unwrap().len(), 0);
        assert_eq!(queue.list().unwrap(), vec![alpha]);
    }

    #[test]
    fn test_messages_survive_reopen() {
        let (dir, queue) = queue();
        let inbox = InboxId::for_name("fleet");
        let id = queue.enqueue(&inbox, "persist me").unwrap();
        drop(queue);

        let reopened = InboxQueue::open(dir.path().join("inbox")).unwrap();
        let pending: Vec<_> = reopened.poll(&inbox).unwrap().collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].payload, "persist me");
    }

    #[test]
    fn test_torn_line_is_skipped_and_repaired() {
        let (_dir, queue) = queue();
        let inbox = InboxId::for_name("fleet");
        let first = queue.enqueue(&inbox, "before crash").unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(queue.log_path(&inbox))
            .unwrap();
        file.write_all(b"{\"kind\":\"message\",\"id\":\"tor").unwrap();
        drop(file);

        let second = queue.enqueue(&inbox, "after crash").unwrap();
        assert_eq!(ids(queue.poll(&inbox).unwrap()), vec![first, second]);
    }

    #[test]
    fn test_prune_drops_acked_and_expired() {
        let (_dir, queue) = queue();
        let inbox = InboxId::for_name("fleet");

        let acked = queue.enqueue(&inbox, "done").unwrap();
        let mut old = InboxMessage::new(inbox.clone(), "stale");
        old.enqueued_at = 1_000;
        queue.enqueue_message(old).unwrap();
        let fresh = queue.enqueue(&inbox, "fresh").unwrap();
        queue.ack(&inbox, &acked).unwrap();

        let removed = queue.prune(&inbox, Duration::from_secs(3600)).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(ids(queue.poll(&inbox).unwrap()), vec![fresh.clone()]);

        let log = std::fs::read_to_string(queue.log_path(&inbox)).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains(fresh.as_str()));

        assert_eq!(queue.prune(&inbox, Duration::from_secs(3600)).unwrap(), 0);
    }

    #[test]
    fn test_concurrent_producers_do_not_lose_messages() {
        let (_dir, queue) = queue();
        let inbox = InboxId::for_name("fleet");

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let queue = queue.clone();
                let inbox = inbox.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        queue.enqueue(&inbox, format!("{n}-{i}")).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let pending: Vec<_> = queue.poll(&inbox).unwrap().collect();
        assert_eq!(pending.len(), 80);
        let unique: HashSet<_> = pending.iter().map(|m| m.id.clone()).collect();
        assert_eq!(unique.len(), 80);
    }

    #[test]
    fn test_message_serialization_shape() {
        let message = InboxMessage::new(InboxId::for_name("fleet"), "hi").with_sender("lead");
        let json = serde_json::to_value(Record::Message(message)).unwrap();
        assert_eq!(json["kind"], "message");
        assert_eq!(json["inbox"], "fleet");
        assert_eq!(json["payload"], "hi");
        assert_eq!(json["sender"], "lead");
    }
}
