/// The reason a handler attempt did not complete normally.
///
/// Kept separate from a bare `anyhow::Error` so the consume loop can route
/// `Poison` messages to ack-and-drop and `Transient` failures to the
/// retry/DLQ scheduler without string-sniffing the error text.
#[derive(Debug)]
pub enum HandlerFailure {
    /// Worth retrying: broker hiccup, ledger write failure, artifact I/O
    /// error, or an intentionally injected pre-effect failure.
    Transient(anyhow::Error),
    /// Not worth retrying: the command itself is malformed. Acked and
    /// dropped by the consume loop, never DLQ'd.
    Poison(String),
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerFailure::Transient(e) => write!(f, "transient handler failure: {e}"),
            HandlerFailure::Poison(reason) => write!(f, "poison message: {reason}"),
        }
    }
}

impl std::error::Error for HandlerFailure {}

impl From<anyhow::Error> for HandlerFailure {
    fn from(e: anyhow::Error) -> Self {
        HandlerFailure::Transient(e)
    }
}
