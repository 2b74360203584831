/// Splits a byte stream from a child process into lines. `\n`, `\r\n` and a
/// bare `\r` all end a line; a partial trailing line waits for more input.
///
/// Input is raw bytes so a multi-byte character split across reads is only
/// decoded once its line is complete. A trailing `\r` is held back until the
/// next chunk shows whether a `\n` follows it.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_pending_bytes: Option<usize>,
    discarded_bytes: usize,
}

impl LineBuffer {
    pub fn new(max_pending_bytes: Option<usize>) -> Self {
        Self {
            pending: Vec::new(),
            max_pending_bytes,
            discarded_bytes: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n' || b == b'\r') {
            let ending = match (self.pending[end], self.pending.get(end + 1)) {
                (b'\r', None) => break,
                (b'\r', Some(b'\n')) => 2,
                _ => 1,
            };
            lines.push(String::from_utf8_lossy(&self.pending[..end]).into_owned());
            self.pending.drain(..end + ending);
        }

        if let Some(max) = self.max_pending_bytes {
            if self.pending.len() > max {
                let mut cut = self.pending.len() - max;
                while self.pending.get(cut).is_some_and(|&b| b & 0b1100_0000 == 0b1000_0000) {
                    cut += 1;
                }
                self.pending.drain(..cut);
                self.discarded_bytes = self.discarded_bytes.saturating_add(cut);
            }
        }
        lines
    }

    /// Bytes dropped from overlong partial lines since the last call.
    pub fn take_discarded_bytes(&mut self) -> usize {
        std::mem::take(&mut self.discarded_bytes)
    }

    /// Returns whatever partial line is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let mut rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            return None;
        }
        if rest.last() == Some(&b'\r') {
            rest.pop();
        }
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
