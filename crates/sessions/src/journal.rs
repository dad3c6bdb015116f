//! On-disk journal format.
//!
//! One `<session_id>.jsonl` file per session. The first line is the
//! [`SessionHeader`](crate::store::SessionHeader); every following line is a
//! [`Message`]. Prefix rewrites go through `<session_id>.jsonl.tmp` and an
//! atomic rename, so concurrent readers of the file observe either the old
//! or the new journal, never a torn one.

use std::io::Write;
use std::path::{Path, PathBuf};

use spindle_domain::{Error, Message, Result};

use crate::store::SessionHeader;

pub fn journal_path(base_dir: &Path, session_id: &str) -> PathBuf {
    base_dir.join(format!("{session_id}.jsonl"))
}

/// Write a fresh journal: header line only. Used on lazy session creation.
pub fn init(path: &Path, header: &SessionHeader) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .map_err(Error::Io)?;
    let line = serde_json::to_string(header)?;
    file.write_all(line.as_bytes()).map_err(Error::Io)?;
    file.write_all(b"\n").map_err(Error::Io)?;
    file.flush().map_err(Error::Io)?;
    Ok(())
}

/// Append one message line. The write is flushed before returning.
pub fn append(path: &Path, message: &Message) -> Result<()> {
    let line = serde_json::to_string(message)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(Error::Io)?;
    file.write_all(line.as_bytes()).map_err(Error::Io)?;
    file.write_all(b"\n").map_err(Error::Io)?;
    file.flush().map_err(Error::Io)?;
    Ok(())
}

/// Load a journal. Returns `None` when the file does not exist. Malformed
/// message lines are skipped with a warning; a malformed header is an error.
pub fn load(path: &Path) -> Result<Option<(SessionHeader, Vec<Message>)>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());

    let header_line = lines
        .next()
        .ok_or_else(|| Error::Storage(format!("empty journal: {}", path.display())))?;
    let header: SessionHeader = serde_json::from_str(header_line)
        .map_err(|e| Error::Storage(format!("malformed journal header: {e}")))?;

    let mut messages = Vec::new();
    for line in lines {
        match serde_json::from_str::<Message>(line) {
            Ok(msg) => messages.push(msg),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping malformed journal line"
                );
            }
        }
    }
    Ok(Some((header, messages)))
}

/// Rewrite the whole journal atomically: write `<path>.tmp`, rename over the
/// original.
pub fn rewrite(path: &Path, header: &SessionHeader, messages: &[Message]) -> Result<()> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = std::fs::File::create(&tmp).map_err(Error::Io)?;
        let mut buf = serde_json::to_string(header)?;
        buf.push('\n');
        for msg in messages {
            buf.push_str(&serde_json::to_string(msg)?);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).map_err(Error::Io)?;
        file.flush().map_err(Error::Io)?;
    }
    std::fs::rename(&tmp, path).map_err(Error::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn header(id: &str) -> SessionHeader {
        SessionHeader {
            session_id: id.to_owned(),
            created_at: Utc::now(),
            provider: "fake".into(),
            model: "fake-1".into(),
            workspace_dir: PathBuf::from("."),
            usage: Default::default(),
            parent_session_id: None,
        }
    }

    #[test]
    fn init_append_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(dir.path(), "s1");

        init(&path, &header("s1")).unwrap();
        append(&path, &Message::user("hello")).unwrap();
        append(&path, &Message::assistant("hi")).unwrap();

        let (hdr, messages) = load(&path).unwrap().unwrap();
        assert_eq!(hdr.session_id, "s1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].content, "hi");
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(dir.path(), "ghost");
        assert!(load(&path).unwrap().is_none());
    }

    #[test]
    fn malformed_message_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(dir.path(), "s1");
        init(&path, &header("s1")).unwrap();
        append(&path, &Message::user("ok")).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{not json}\n")
            .unwrap();

        let (_, messages) = load(&path).unwrap().unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(dir.path(), "s1");
        init(&path, &header("s1")).unwrap();
        for i in 0..5 {
            append(&path, &Message::user(format!("msg {i}"))).unwrap();
        }

        let kept = vec![Message::system("summary"), Message::user("msg 4")];
        rewrite(&path, &header("s1"), &kept).unwrap();

        let (_, messages) = load(&path).unwrap().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "summary");
        assert!(!path.with_extension("jsonl.tmp").exists());
    }
}
