//! Streaming delivery of multi-batch result sequences.
//!
//! A [`Cursor`] is created when a START yields `SUCCESS_SEQUENCE` or
//! `SUCCESS_PARTIAL`. It buffers the delivered batch, hands values out in
//! server order, and requests the next batch with CONTINUE once the buffer
//! drains past a threshold. At most one CONTINUE is in flight per cursor.

use std::collections::VecDeque;
use std::fmt;

use tokio::sync::oneshot;
use tracing::debug;

use crate::codec::Response;
use crate::connection::Connection;
use crate::datum::{Datum, FormatOptions};
use crate::error::{ReqlError, Result};
use crate::proto::{QueryType, ResponseType};
use crate::term::Term;

pub struct Cursor {
  conn: Connection,
  token: u64,
  term: Term,
  formats: FormatOptions,
  items: VecDeque<Datum>,
  /// Refill once the buffer holds no more than this many items. Updated to
  /// half the last observed batch size, never below one.
  threshold: usize,
  outstanding: Option<oneshot::Receiver<Result<Response>>>,
  error: Option<ReqlError>,
  end: bool,
  feed: bool,
  closed: bool,
  profile: Option<serde_json::Value>,
}

impl Cursor {
  pub(crate) fn new(
    conn: Connection,
    token: u64,
    term: Term,
    formats: FormatOptions,
    first: Response,
  ) -> Result<Self> {
    let mut cursor = Self {
      conn,
      token,
      term,
      formats,
      items: VecDeque::new(),
      threshold: 1,
      outstanding: None,
      error: None,
      end: false,
      feed: first.is_feed(),
      closed: false,
      profile: first.profile.clone(),
    };
    cursor.absorb(first)?;
    Ok(cursor)
  }

  /// Whether this cursor is a changefeed and will never end on its own.
  pub fn is_feed(&self) -> bool {
    self.feed
  }

  /// Profiling data attached to the first response, when the run asked
  /// for it.
  pub fn profile(&self) -> Option<&serde_json::Value> {
    self.profile.as_ref()
  }

  /// Next value in server-sent order. `Ok(None)` once the sequence is
  /// cleanly exhausted; a cursor that was closed (or already reported an
  /// error) fails with `CursorEmpty` instead.
  pub async fn next(&mut self) -> Result<Option<Datum>> {
    loop {
      if self.closed {
        return Err(ReqlError::CursorEmpty);
      }

      if let Some(item) = self.items.pop_front() {
        // Refill behind the consumer so the stream stays ahead. A failed
        // prefetch must not swallow the value in hand; it surfaces once the
        // buffer drains.
        if let Err(e) = self.maybe_continue().await {
          self.error.get_or_insert(e);
          self.end = true;
        }
        return Ok(Some(item));
      }

      if let Some(error) = self.error.take() {
        self.closed = true;
        return Err(error);
      }

      if self.end {
        return Ok(None);
      }

      self.maybe_continue().await?;
      let Some(rx) = self.outstanding.take() else {
        return Ok(None);
      };
      match rx.await {
        Ok(Ok(response)) => self.absorb(response)?,
        Ok(Err(error)) => {
          self.closed = true;
          return Err(error);
        }
        Err(_) => {
          self.closed = true;
          return Err(ReqlError::connection_closed());
        }
      }
    }
  }

  /// Collect every remaining value. Refuses on a changefeed, which would
  /// never finish.
  pub async fn collect(&mut self) -> Result<Vec<Datum>> {
    if self.feed {
      return Err(ReqlError::driver("Cannot collect an infinite changefeed."));
    }
    let mut items = Vec::new();
    while let Some(item) = self.next().await? {
      items.push(item);
    }
    Ok(items)
  }

  /// Close the cursor. If the sequence is still partial, submits STOP and
  /// consumes the terminal acknowledgement. Later `next` calls fail with
  /// `CursorEmpty`.
  pub async fn close(&mut self) -> Result<()> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;
    self.items.clear();

    // Any in-flight CONTINUE is abandoned; the reader discards its batch.
    if self.outstanding.take().is_some() {
      self.conn.remove_waiter(self.token);
    }

    if !self.end && self.conn.is_open() {
      let rx = self.conn.register_waiter(self.token);
      match self.conn.send_control(self.token, QueryType::Stop).await {
        Ok(()) => {
          // The ack is an empty terminal sequence; content is irrelevant.
          let _ = rx.await;
        }
        Err(e) => {
          self.conn.remove_waiter(self.token);
          debug!(token = self.token, error = %e, "STOP could not be sent");
        }
      }
      self.end = true;
    }
    Ok(())
  }

  /// Issue CONTINUE when the buffer is at or below the threshold and no
  /// request is already outstanding.
  async fn maybe_continue(&mut self) -> Result<()> {
    if self.end
      || self.closed
      || self.error.is_some()
      || self.outstanding.is_some()
      || self.items.len() > self.threshold
    {
      return Ok(());
    }

    let rx = self.conn.register_waiter(self.token);
    match self.conn.send_control(self.token, QueryType::Continue).await {
      Ok(()) => {
        self.outstanding = Some(rx);
        Ok(())
      }
      Err(e) => {
        self.conn.remove_waiter(self.token);
        Err(e)
      }
    }
  }

  /// Fold one response into the buffer and update the stream state.
  fn absorb(&mut self, response: Response) -> Result<()> {
    match response.response_type {
      ResponseType::SuccessPartial | ResponseType::SuccessSequence => {
        self.threshold = (response.data.len() / 2).max(1);
        for value in &response.data {
          self.items.push_back(Datum::from_wire(value, &self.formats)?);
        }
        if response.response_type == ResponseType::SuccessSequence {
          self.end = true;
        }
      }
      _ => {
        self.error = Some(response.make_error(Some(self.term.clone())));
        self.end = true;
      }
    }
    Ok(())
  }
}

impl fmt::Debug for Cursor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let status = if self.error.is_some() {
      "errored"
    } else if self.closed {
      "closed"
    } else if self.end && self.items.is_empty() {
      "done streaming"
    } else {
      "streaming"
    };
    f.debug_struct("Cursor")
      .field("token", &self.token)
      .field("status", &status)
      .field("buffered", &self.items.len())
      .field("feed", &self.feed)
      .finish()
  }
}

impl Drop for Cursor {
  fn drop(&mut self) {
    if self.closed || self.end || !self.conn.is_open() {
      return;
    }
    // Best-effort STOP so the server can release the stream.
    let conn = self.conn.clone();
    let token = self.token;
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      handle.spawn(async move {
        let _ = conn.send_control(token, QueryType::Stop).await;
      });
    }
  }
}
