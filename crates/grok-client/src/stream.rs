//! Consumer side of a call: token channel, terminal error slot, cancellation

use futures_util::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{Error, Result};

/// Single-use sender half of the terminal error slot.
///
/// The first `fail` wins; later ones are discarded.
#[derive(Debug)]
pub(crate) struct ErrorSlot {
    tx: Option<oneshot::Sender<Error>>,
}

impl ErrorSlot {
    pub(crate) fn new(tx: oneshot::Sender<Error>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Returns false when the slot was already filled.
    pub(crate) fn fail(&mut self, error: Error) -> bool {
        match self.tx.take() {
            // Consumer may already be gone; nothing to report to then
            Some(tx) => {
                let _ = tx.send(error);
                true
            }
            None => false,
        }
    }
}

/// Live token sequence of one upstream call.
///
/// Single-pass: each token is yielded once, in upstream order. The sequence
/// ends with `None` after normal completion, or with exactly one `Err` and
/// then `None`. Dropping the stream cancels the producer and closes the
/// upstream connection.
pub struct TokenStream {
    tokens: mpsc::Receiver<String>,
    error: oneshot::Receiver<Error>,
    cancel: CancellationToken,
    _producer: DropGuard,
    finished: bool,
}

impl TokenStream {
    pub(crate) fn new(
        tokens: mpsc::Receiver<String>,
        error: oneshot::Receiver<Error>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tokens,
            error,
            _producer: cancel.clone().drop_guard(),
            cancel,
            finished: false,
        }
    }

    /// Wait for the next token, the terminal error, or cancellation.
    ///
    /// Once cancellation has fired no further tokens are yielded, even if one
    /// is already queued. Queued tokens are otherwise delivered before the
    /// terminal error so partial output is never lost.
    pub async fn next_token(&mut self) -> Option<Result<String>> {
        if self.finished {
            return None;
        }

        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Some(Error::Cancelled),
            token = self.tokens.recv() => match token {
                Some(token) => return Some(Ok(token)),
                // Producer finished; its error, if any, was sent before the
                // token channel closed
                None => (&mut self.error).await.ok(),
            },
            error = &mut self.error => error.ok(),
        };

        self.finished = true;
        outcome.map(Err)
    }

    /// Adapt into a [`Stream`] for response bodies.
    pub fn into_stream(self) -> impl Stream<Item = Result<String>> + Send + 'static {
        futures_util::stream::unfold(self, |mut tokens| async move {
            let item = tokens.next_token().await?;
            Some((item, tokens))
        })
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("finished", &self.finished)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
