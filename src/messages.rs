//! The per-VM message log.
//!
//! Diagnostics from the core (VM errors, warnings, internal errors) are
//! recorded here and mirrored to the `log` facade. The log keeps a small
//! fixed number of entries, recycling the oldest, so diagnostics never
//! accumulate without bound in a long-lived VM.

/// Kinds of log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Progress information.
    Info,
    /// Compile warning (from an external compiler, via the embedding API).
    CompileWarning,
    /// Compile error.
    CompileError,
    /// VM warning.
    VmWarning,
    /// VM error.
    VmError,
    /// Internal error in the runtime core.
    InternalError,
    /// Fatal error.
    Fatal,
}

/// One diagnostic entry.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub text: String,
}

/// Number of entries retained; the oldest is recycled beyond this.
const MESSAGE_SLOTS: usize = 16;

/// Bounded diagnostic log.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        MessageLog::default()
    }

    /// Appends a message, recycling the oldest slot when full.
    pub fn push(&mut self, kind: MessageKind, text: String) {
        match kind {
            MessageKind::Info => log::debug!("{text}"),
            MessageKind::CompileWarning | MessageKind::VmWarning => log::warn!("{text}"),
            _ => log::error!("{text}"),
        }
        if self.entries.len() >= MESSAGE_SLOTS {
            self.entries.remove(0);
        }
        self.entries.push(Message { kind, text });
    }

    pub fn info(&mut self, text: String) {
        self.push(MessageKind::Info, text);
    }

    pub fn vm_warning(&mut self, text: String) {
        self.push(MessageKind::VmWarning, text);
    }

    pub fn vm_error(&mut self, text: String) {
        self.push(MessageKind::VmError, text);
    }

    pub fn internal_error(&mut self, text: String) {
        self.push(MessageKind::InternalError, text);
    }

    /// The retained entries, oldest first.
    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    /// Drops everything except warnings.
    pub fn clear_errors(&mut self) {
        self.entries.retain(|m| {
            matches!(
                m.kind,
                MessageKind::CompileWarning | MessageKind::VmWarning
            )
        });
    }

    /// Drops warnings.
    pub fn clear_warnings(&mut self) {
        self.entries.retain(|m| {
            !matches!(
                m.kind,
                MessageKind::CompileWarning | MessageKind::VmWarning
            )
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_recycles_oldest() {
        let mut log = MessageLog::new();
        for i in 0..20 {
            log.info(format!("message {i}"));
        }
        assert_eq!(log.entries().len(), MESSAGE_SLOTS);
        assert_eq!(log.entries()[0].text, "message 4");
    }

    #[test]
    fn clear_errors_keeps_warnings() {
        let mut log = MessageLog::new();
        log.vm_error("boom".into());
        log.vm_warning("careful".into());
        log.clear_errors();
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].kind, MessageKind::VmWarning);
    }
}
