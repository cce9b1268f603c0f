//! RFC 764 NETASCII line ending conversion, as required by RFC 1350 mode "netascii"

/// Convert local line endings to the wire form.
///
/// Bare LF becomes CR+LF and a bare CR becomes CR+NUL; existing CR+LF pairs
/// are kept.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len() + data.len() / 80);

    for (i, &byte) in data.iter().enumerate() {
        match byte {
            b'\n' => {
                if i == 0 || data[i - 1] != b'\r' {
                    result.push(b'\r');
                }
                result.push(b'\n');
            }
            b'\r' => {
                result.push(b'\r');
                if data.get(i + 1) != Some(&b'\n') {
                    result.push(0);
                }
            }
            _ => result.push(byte),
        }
    }

    result
}

/// Convert wire line endings back to local form.
///
/// CR+LF becomes LF and CR+NUL becomes a literal CR. Any other CR is kept.
pub fn decode(data: &[u8]) -> Vec<u8> {
    let mut decoder = Decoder::default();
    let mut result = decoder.decode_chunk(data);
    result.extend(decoder.finish());
    result
}

/// Incremental form of [`decode`] for data that arrives in pieces.
///
/// A CR at the end of one chunk is held back until the next chunk shows
/// what follows it.
#[derive(Debug, Default)]
pub struct Decoder {
    pending_cr: bool,
}

impl Decoder {
    pub fn decode_chunk(&mut self, data: &[u8]) -> Vec<u8> {
        let mut result = Vec::with_capacity(data.len() + 1);

        for &byte in data {
            if self.pending_cr {
                self.pending_cr = false;
                match byte {
                    b'\n' => {
                        result.push(b'\n');
                        continue;
                    }
                    0 => {
                        result.push(b'\r');
                        continue;
                    }
                    _ => result.push(b'\r'),
                }
            }

            if byte == b'\r' {
                self.pending_cr = true;
            } else {
                result.push(byte);
            }
        }

        result
    }

    /// Flush a CR left over from the last chunk.
    pub fn finish(self) -> Vec<u8> {
        if self.pending_cr {
            vec![b'\r']
        } else {
            Vec::new()
        }
    }
}
