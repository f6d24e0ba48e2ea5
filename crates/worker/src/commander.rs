#![forbid(unsafe_code)]

/// One incoming update from the command source.
#[derive(Clone, Debug)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

/// A source message; `text` is absent for non-text updates.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub text: Option<String>,
    pub date: i64,
}

#[derive(Debug)]
pub struct CommanderError(pub String);

impl std::fmt::Display for CommanderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CommanderError {}

/// The instruction-source capability. Real transports live outside this
/// repository; the in-tree implementation is the scripted double.
pub trait Commander {
    /// Long-poll for updates past `offset`. `timeout_seconds == 0` means
    /// return immediately (drain-through mode).
    fn get_updates(&mut self, offset: i64, timeout_seconds: i64)
        -> Result<Vec<Update>, CommanderError>;

    fn send_message(&mut self, chat_id: i64, text: &str) -> Result<(), CommanderError>;

    /// Post an approval prompt for a staged artifact. Transports without
    /// inline approval UI fall back to a plain message.
    fn send_approval_request(
        &mut self,
        chat_id: i64,
        text: &str,
        _tx_id: &str,
    ) -> Result<(), CommanderError> {
        self.send_message(chat_id, text)
    }
}
