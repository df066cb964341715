//! The GATT transaction engine: reassembles request fragments arriving on the write
//! characteristic and streams response fragments out through the read characteristic.
//!
//! One transaction is in flight per BLE connection:
//!
//! ```notrust
//! WaitingForInitialWrite → ReadingRequest → HandlingRequest
//!        → WaitingForInitialRead → WritingResponse → WaitingForInitialWrite
//! ```
//!
//! The request and response buffers are supplied by the caller at connection setup; the engine
//! never allocates.

use crate::bytes::{ByteReader, ByteWriter, FromBytes};
use crate::HapError;

use super::pdu::{Fragment, Header, Opcode, Status};

/// Transaction progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    WaitingForInitialWrite,
    ReadingRequest,
    HandlingRequest,
    WaitingForInitialRead,
    WritingResponse,
}

/// Outcome of feeding one write fragment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// More fragments are needed.
    Incomplete,
    /// The request body is complete; dispatch it and produce a response.
    Complete,
}

/// A request being assembled and its response being drained.
pub struct Transaction<'b> {
    state: State,
    opcode: Opcode,
    tid: u8,
    iid: u16,
    request: &'b mut [u8],
    request_len: usize,
    received: usize,
    response: &'b mut [u8],
    response_len: usize,
    response_status: Status,
    offset: usize,
}

impl<'b> Transaction<'b> {
    /// Creates an idle transaction over caller-supplied request and response buffers.
    pub fn new(request: &'b mut [u8], response: &'b mut [u8]) -> Self {
        Transaction {
            state: State::WaitingForInitialWrite,
            opcode: Opcode::Unknown(0),
            tid: 0,
            iid: 0,
            request,
            request_len: 0,
            received: 0,
            response,
            response_len: 0,
            response_status: Status::Success,
            offset: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn tid(&self) -> u8 {
        self.tid
    }

    pub fn iid(&self) -> u16 {
        self.iid
    }

    /// Whether the link may be torn down without losing a response in flight.
    pub fn is_safe_to_disconnect(&self) -> bool {
        self.state == State::WaitingForInitialWrite
    }

    /// Discards the transaction (link disconnect).
    pub fn cancel(&mut self) {
        self.state = State::WaitingForInitialWrite;
        self.request_len = 0;
        self.received = 0;
        self.response_len = 0;
        self.offset = 0;
    }

    /// Feeds one fragment received on the write characteristic.
    pub fn handle_write(&mut self, bytes: &[u8]) -> Result<WriteOutcome, HapError> {
        let fragment = Fragment::from_bytes(&mut ByteReader::new(bytes))
            .map_err(|_| HapError::InvalidData)?;

        match (self.state, fragment) {
            (
                State::WaitingForInitialWrite,
                Fragment::First {
                    header: Header::Request { opcode, tid, iid },
                    body_len,
                    body,
                },
            ) => {
                if usize::from(body_len) > self.request.len() {
                    warn!("request body of {} bytes overflows buffer", body_len);
                    return Err(HapError::InvalidData);
                }
                if body.len() > usize::from(body_len) {
                    return Err(HapError::InvalidData);
                }
                self.opcode = opcode;
                self.tid = tid;
                self.iid = iid;
                self.request_len = usize::from(body_len);
                self.request[..body.len()].copy_from_slice(body);
                self.received = body.len();
                self.finish_write_fragment()
            }

            (State::ReadingRequest, Fragment::Continuation { tid, body }) => {
                if tid != self.tid {
                    warn!("continuation TID {:#x} does not match {:#x}", tid, self.tid);
                    return Err(HapError::InvalidData);
                }
                if self.received + body.len() > self.request_len {
                    return Err(HapError::InvalidData);
                }
                self.request[self.received..self.received + body.len()].copy_from_slice(body);
                self.received += body.len();
                self.finish_write_fragment()
            }

            // A new request while one is being handled is a protocol violation, not a reset.
            (State::HandlingRequest, Fragment::First { .. })
            | (State::WaitingForInitialRead, Fragment::First { .. })
            | (State::WritingResponse, Fragment::First { .. }) => Err(HapError::InvalidState),

            _ => Err(HapError::InvalidState),
        }
    }

    fn finish_write_fragment(&mut self) -> Result<WriteOutcome, HapError> {
        if self.received == self.request_len {
            self.state = State::HandlingRequest;
            Ok(WriteOutcome::Complete)
        } else {
            self.state = State::ReadingRequest;
            Ok(WriteOutcome::Incomplete)
        }
    }

    /// The reassembled request body. Only meaningful in `HandlingRequest`.
    pub fn request_body(&self) -> &[u8] {
        &self.request[..self.request_len]
    }

    /// Splits the transaction into the request body and the writable response buffer, so a
    /// dispatcher can parse the one while serializing into the other.
    pub fn split(&mut self) -> (&[u8], &mut [u8]) {
        (&self.request[..self.request_len], self.response)
    }

    /// Records the dispatched response and arms the read characteristic.
    ///
    /// `body_len` bytes must already have been written into the buffer returned by [`split`].
    ///
    /// [`split`]: #method.split
    pub fn set_response(&mut self, status: Status, body_len: usize) -> Result<(), HapError> {
        if self.state != State::HandlingRequest {
            return Err(HapError::InvalidState);
        }
        if body_len > self.response.len() || body_len > super::pdu::MAX_BODY_BYTES {
            return Err(HapError::OutOfResources);
        }
        self.response_status = status;
        self.response_len = body_len;
        self.offset = 0;
        self.state = State::WaitingForInitialRead;
        Ok(())
    }

    /// Produces the next response fragment, sized to the GATT MTU.
    ///
    /// Returns the number of bytes written into `out` and whether this was the final fragment.
    /// After the final fragment the transaction is ready for the next request.
    pub fn pop_read_fragment(
        &mut self,
        mtu: usize,
        out: &mut [u8],
    ) -> Result<(usize, bool), HapError> {
        let mtu = mtu.min(out.len());

        use crate::bytes::ToBytes;

        let written = match self.state {
            State::WaitingForInitialRead => {
                // control + tid + status (+ body length when a body is present)
                let header = if self.response_len > 0 { 5 } else { 3 };
                if mtu < header {
                    return Err(HapError::OutOfResources);
                }
                let chunk = (self.response_len - self.offset).min(mtu - header);

                let mut writer = ByteWriter::new(out);
                let fragment = Fragment::First {
                    header: Header::Response {
                        tid: self.tid,
                        status: self.response_status,
                    },
                    body_len: self.response_len as u16,
                    body: &self.response[..chunk],
                };
                fragment.to_bytes(&mut writer).map_err(|_| HapError::OutOfResources)?;
                self.offset = chunk;
                header + chunk
            }

            State::WritingResponse => {
                let header = 2; // control + tid
                if mtu < header + 1 {
                    return Err(HapError::OutOfResources);
                }
                let chunk = (self.response_len - self.offset).min(mtu - header);

                let mut writer = ByteWriter::new(out);
                let fragment = Fragment::Continuation {
                    tid: self.tid,
                    body: &self.response[self.offset..self.offset + chunk],
                };
                fragment.to_bytes(&mut writer).map_err(|_| HapError::OutOfResources)?;
                self.offset += chunk;
                header + chunk
            }

            _ => return Err(HapError::InvalidState),
        };

        let is_final = self.offset == self.response_len;
        self.state = if is_final {
            State::WaitingForInitialWrite
        } else {
            State::WritingResponse
        };
        Ok((written, is_final))
    }
}
