//! Wire framing for the control socket. Messages are JSON values written
//! back to back with no separator, pretty printed with tab indentation the
//! same way the target's own encoder does it.

use serde::Serialize;
use serde_json::ser::PrettyFormatter;

use crate::{Request, Response};

/// Encode one request envelope the way the target formats its own frames:
/// pretty printed, tab indented, newline terminated.
pub(crate) fn encode_request(request: &Request) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::with_capacity(128);
    let formatter = PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    request.serialize(&mut serializer)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Incremental decoder over the stream of concatenated response values.
/// Bytes are appended as they arrive; complete values are taken off the
/// front of the buffer one at a time.
#[derive(Default)]
pub(crate) struct ResponseDecoder {
    buf: Vec<u8>,
}

impl ResponseDecoder {
    /// Append freshly read bytes.
    pub(crate) fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Take one complete value off the front of the buffer. `Ok(None)`
    /// means no complete value has arrived yet. A malformed value is an
    /// error; recover with `rebuild` before decoding further.
    pub(crate) fn next(&mut self) -> Result<Option<Response>, serde_json::Error> {
        let (response, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<Response>();
            match stream.next() {
                None => {
                    // Only whitespace buffered.
                    self.buf.clear();
                    return Ok(None);
                }
                Some(Ok(response)) => (response, stream.byte_offset()),
                Some(Err(err)) if err.is_eof() => return Ok(None),
                Some(Err(err)) => return Err(err),
            }
        };
        self.buf.drain(.. consumed);
        Ok(Some(response))
    }

    /// Drop whatever is buffered so the next read starts at a fresh value
    /// boundary. Returns the number of bytes thrown away.
    pub(crate) fn rebuild(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_framing_is_tab_indented() {
        let request = Request::new(1, "bdev_get_bdevs", None);
        let buf = encode_request(&request).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "{\n\t\"id\": 1,\n\t\"jsonrpc\": \"2.0\",\n\t\"method\": \"bdev_get_bdevs\"\n}\n"
        );
    }

    #[test]
    fn elided_params_leave_no_key() {
        let request = Request::new(2, "spdk_get_version", None);
        let buf = encode_request(&request).unwrap();
        assert!(!String::from_utf8(buf).unwrap().contains("params"));
    }

    fn response_bytes(id: u32) -> Vec<u8> {
        serde_json::to_vec(&Response {
            id,
            jsonrpc: Some("2.0".into()),
            result: Some(serde_json::json!({ "id": id })),
            error: None,
        })
        .unwrap()
    }

    #[test]
    fn concatenated_values_split_cleanly() {
        let mut decoder = ResponseDecoder::default();
        let mut wire = response_bytes(1);
        wire.extend_from_slice(&response_bytes(2));

        // Feed everything plus half of a third value.
        let third = response_bytes(3);
        decoder.extend(&wire);
        decoder.extend(&third[.. third.len() / 2]);

        assert_eq!(decoder.next().unwrap().unwrap().id, 1);
        assert_eq!(decoder.next().unwrap().unwrap().id, 2);
        assert!(decoder.next().unwrap().is_none());

        decoder.extend(&third[third.len() / 2 ..]);
        assert_eq!(decoder.next().unwrap().unwrap().id, 3);
        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn malformed_value_recovers_after_rebuild() {
        let mut decoder = ResponseDecoder::default();
        decoder.extend(b"not json at all");
        assert!(decoder.next().is_err());
        assert_eq!(decoder.rebuild(), 15);

        decoder.extend(&response_bytes(9));
        assert_eq!(decoder.next().unwrap().unwrap().id, 9);
    }
}
