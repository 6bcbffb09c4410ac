use super::{Error, Head, StreamId};

/// A PRIORITY frame. Parsed for validity, then ignored.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Priority {
    stream_id: StreamId,
}

impl Priority {
    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Priority, Error> {
        if head.stream_id().is_connection() {
            return Err(Error::InvalidStreamId);
        }
        if payload.len() != 5 {
            return Err(Error::BadFrameSize);
        }
        Ok(Priority {
            stream_id: head.stream_id(),
        })
    }

    #[allow(unused)]
    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}
