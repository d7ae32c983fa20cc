//! Plain-text rendering of the live transcript.
//!
//! The printer reads from the same store the engine writes to. Each
//! notification names a message; the printer looks the message up and writes
//! only what it has not written before, so a terminal tail of a session reads
//! like the chat view without redrawing it.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::sync::Arc;

use chamber_sync_core::{MessageId, MessageRecord, PartId, Role, SessionId};
use chamber_sync_engine::{ConnectionStatus, StatusUpdate, ViewNotification};
use chamber_sync_store::{PermissionStore, SessionStore};

#[derive(Debug, Default)]
struct Printed {
    chars: usize,
    blocks: HashSet<PartId>,
}

/// Writes new transcript content to `out`.
pub struct Printer<W: Write> {
    out: W,
    store: Arc<dyn SessionStore>,
    permissions: Arc<dyn PermissionStore>,
    printed: HashMap<MessageId, Printed>,
    current: Option<MessageId>,
}

impl<W: Write> Printer<W> {
    /// Create a printer over `store`.
    pub fn new(out: W, store: Arc<dyn SessionStore>, permissions: Arc<dyn PermissionStore>) -> Self {
        Self {
            out,
            store,
            permissions,
            printed: HashMap::new(),
            current: None,
        }
    }

    /// Render one notification.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the output fails.
    pub fn handle(&mut self, notification: &ViewNotification) -> io::Result<()> {
        match notification {
            ViewNotification::TextGrew {
                session_id,
                message_id,
            }
            | ViewNotification::BlockAdded {
                session_id,
                message_id,
            } => self.render_message(session_id, message_id)?,
            ViewNotification::MessageCompleted {
                session_id,
                message_id,
            } => {
                self.render_message(session_id, message_id)?;
                if self.current.as_ref() == Some(message_id) {
                    writeln!(self.out)?;
                    self.current = None;
                }
            }
            ViewNotification::EmptyResponse { message_id, .. } => {
                writeln!(self.out, "\n[{message_id}: empty response]")?;
            }
            ViewNotification::PermissionPrompt {
                session_id,
                permission_id,
            } => {
                let title = self
                    .permissions
                    .pending_permissions(session_id)
                    .into_iter()
                    .find(|p| &p.id == permission_id)
                    .map_or_else(|| permission_id.to_string(), |p| p.title);
                writeln!(self.out, "\n[permission requested: {title}]")?;
            }
            ViewNotification::SessionReloaded { session_id } => self.mark_seen(session_id),
        }
        self.out.flush()
    }

    /// Treat everything currently stored for the session as already printed.
    fn mark_seen(&mut self, session_id: &SessionId) {
        for message in self.store.messages(session_id) {
            let printed = self.printed.entry(message.info.id.clone()).or_default();
            printed.chars = printed.chars.max(visible_text(&message).chars().count());
            printed
                .blocks
                .extend(message.parts.iter().filter(|p| p.is_tool()).map(|p| p.id.clone()));
        }
        self.current = None;
    }

    fn render_message(&mut self, session_id: &SessionId, message_id: &MessageId) -> io::Result<()> {
        let Some(message) = self.store.message(session_id, message_id) else {
            return Ok(());
        };
        let printed = self.printed.entry(message_id.clone()).or_default();
        let text = visible_text(&message);
        let new_text: String = text.chars().skip(printed.chars).collect();
        let new_blocks: Vec<_> = message
            .parts
            .iter()
            .filter(|p| p.is_tool())
            .filter(|p| printed.blocks.insert(p.id.clone()))
            .map(|p| block_label(&p.kind, p.extra.get("tool").and_then(|t| t.as_str())))
            .collect();
        if new_text.is_empty() && new_blocks.is_empty() {
            return Ok(());
        }
        printed.chars = text.chars().count();

        if self.current.as_ref() != Some(message_id) {
            let role = match message.info.role {
                Role::User => "you",
                Role::Assistant => "assistant",
            };
            write!(self.out, "\n{role}> ")?;
            self.current = Some(message_id.clone());
        }
        write!(self.out, "{new_text}")?;
        for label in new_blocks {
            write!(self.out, "\n{label}\n")?;
        }
        Ok(())
    }
}

fn visible_text(message: &MessageRecord) -> String {
    message
        .parts
        .iter()
        .filter(|p| p.is_text() && !p.synthetic)
        .filter_map(|p| p.text.as_deref())
        .collect()
}

fn block_label(kind: &str, tool: Option<&str>) -> String {
    match tool {
        Some(tool) => format!("[{kind}: {tool}]"),
        None => format!("[{kind}]"),
    }
}

/// One line describing a status change, for stderr.
pub fn status_line(update: &StatusUpdate) -> String {
    match (&update.status, &update.hint) {
        (ConnectionStatus::Connected, _) | (_, None) => format!("-- {}", update.status),
        (status, Some(hint)) => format!("-- {status}: {hint}"),
    }
}
