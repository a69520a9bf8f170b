//! Incremental extraction of items from a JSON document that arrives in
//! arbitrary byte slices.
//!
//! The item location uses ijson-style prefixes: dot-separated object keys,
//! with `item` standing for "each element of this array". `item` selects the
//! elements of a top-level array, `data.item` the elements of the array under
//! the top-level `data` key, and an empty location selects the root itself.
//! Only the bytes of the item currently being read are buffered.

use std::collections::VecDeque;
use std::fmt;

use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} at byte {offset}")]
pub struct SplitError {
    pub offset: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Value,
    KeyOrEnd,
    Colon,
    CommaOrEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

#[derive(Debug)]
struct Frame {
    container: Container,
    key: Vec<u8>,
    expect: Expect,
}

#[derive(Debug, Default)]
struct Capture {
    buf: Vec<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

pub struct ItemSplitter {
    target: Vec<Vec<u8>>,
    frames: Vec<Frame>,
    root: Expect,
    capture: Option<Capture>,
    in_string: bool,
    escaped: bool,
    reading_key: bool,
    in_scalar: bool,
    key_buf: Vec<u8>,
    offset: u64,
    ready: VecDeque<JsonValue>,
}

impl fmt::Debug for ItemSplitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemSplitter")
            .field("depth", &self.frames.len())
            .field("offset", &self.offset)
            .field("capturing", &self.capture.is_some())
            .finish()
    }
}

fn is_delimiter(b: u8) -> bool {
    matches!(b, b',' | b']' | b'}' | b' ' | b'\t' | b'\n' | b'\r')
}

impl ItemSplitter {
    pub fn new(location: &str) -> Self {
        Self {
            target: location
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(|segment| segment.as_bytes().to_vec())
                .collect(),
            frames: Vec::new(),
            root: Expect::Value,
            capture: None,
            in_string: false,
            escaped: false,
            reading_key: false,
            in_scalar: false,
            key_buf: Vec::new(),
            offset: 0,
            ready: VecDeque::new(),
        }
    }

    /// Consumes `bytes` and returns every item completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<JsonValue>, SplitError> {
        for &b in bytes {
            self.step(b)?;
            self.offset += 1;
        }
        Ok(self.ready.drain(..).collect())
    }

    /// Checks that the document ended cleanly.
    pub fn finish(&self) -> Result<(), SplitError> {
        if self.capture.is_some() || !self.frames.is_empty() || self.in_string {
            return Err(self.error("document ended inside a value"));
        }
        if self.root == Expect::Value {
            return Err(self.error("empty document"));
        }
        Ok(())
    }

    fn error(&self, reason: impl Into<String>) -> SplitError {
        SplitError {
            offset: self.offset,
            reason: reason.into(),
        }
    }

    fn step(&mut self, b: u8) -> Result<(), SplitError> {
        if self.capture.is_some() {
            return self.step_capture(b);
        }

        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            } else if b == b'"' {
                self.in_string = false;
                if self.reading_key {
                    self.reading_key = false;
                    let key = std::mem::take(&mut self.key_buf);
                    if let Some(frame) = self.frames.last_mut() {
                        frame.key = key;
                        frame.expect = Expect::Colon;
                    }
                }
                return Ok(());
            }
            if self.reading_key {
                self.key_buf.push(b);
            }
            return Ok(());
        }

        if self.in_scalar {
            if !is_delimiter(b) {
                return Ok(());
            }
            self.in_scalar = false;
        }

        match b {
            b' ' | b'\t' | b'\n' | b'\r' => Ok(()),
            b'{' | b'[' => {
                let container = if b == b'{' {
                    Container::Object
                } else {
                    Container::Array
                };
                if self.begin_value()? {
                    self.capture = Some(Capture {
                        buf: vec![b],
                        depth: 1,
                        ..Capture::default()
                    });
                } else {
                    self.frames.push(Frame {
                        container,
                        key: Vec::new(),
                        expect: match container {
                            Container::Object => Expect::KeyOrEnd,
                            Container::Array => Expect::Value,
                        },
                    });
                }
                Ok(())
            }
            b'}' | b']' => {
                let closing = if b == b'}' {
                    Container::Object
                } else {
                    Container::Array
                };
                match self.frames.last() {
                    Some(frame)
                        if frame.container == closing
                            && matches!(
                                (closing, frame.expect),
                                (_, Expect::CommaOrEnd)
                                    | (Container::Object, Expect::KeyOrEnd)
                                    | (Container::Array, Expect::Value)
                            ) =>
                    {
                        self.frames.pop();
                        Ok(())
                    }
                    _ => Err(self.error(format!("unexpected `{}`", b as char))),
                }
            }
            b',' => match self.frames.last_mut() {
                Some(frame) if frame.expect == Expect::CommaOrEnd => {
                    frame.expect = match frame.container {
                        Container::Object => Expect::KeyOrEnd,
                        Container::Array => Expect::Value,
                    };
                    Ok(())
                }
                _ => Err(self.error("unexpected `,`")),
            },
            b':' => match self.frames.last_mut() {
                Some(frame) if frame.expect == Expect::Colon => {
                    frame.expect = Expect::Value;
                    Ok(())
                }
                _ => Err(self.error("unexpected `:`")),
            },
            b'"' => {
                let is_key = matches!(
                    self.frames.last(),
                    Some(Frame {
                        container: Container::Object,
                        expect: Expect::KeyOrEnd,
                        ..
                    })
                );
                if is_key {
                    self.reading_key = true;
                    self.key_buf.clear();
                } else if self.begin_value()? {
                    return Err(self.error("item is a string, expected an object"));
                }
                self.in_string = true;
                Ok(())
            }
            b'-' | b'0'..=b'9' | b't' | b'f' | b'n' => {
                if self.begin_value()? {
                    return Err(self.error("item is a scalar, expected an object"));
                }
                self.in_scalar = true;
                Ok(())
            }
            other => Err(self.error(format!("unexpected byte 0x{other:02x}"))),
        }
    }

    /// Marks the start of a value in the current container and reports whether
    /// the value sits at the item location.
    fn begin_value(&mut self) -> Result<bool, SplitError> {
        let expect = match self.frames.last_mut() {
            Some(frame) => &mut frame.expect,
            None => &mut self.root,
        };
        if *expect != Expect::Value {
            return Err(self.error("unexpected value"));
        }
        *expect = Expect::CommaOrEnd;

        if self.frames.len() != self.target.len() {
            return Ok(false);
        }
        Ok(self
            .frames
            .iter()
            .zip(&self.target)
            .all(|(frame, segment)| match frame.container {
                Container::Array => segment.as_slice() == b"item",
                Container::Object => &frame.key == segment,
            }))
    }

    fn step_capture(&mut self, b: u8) -> Result<(), SplitError> {
        let Some(capture) = self.capture.as_mut() else {
            return Ok(());
        };
        capture.buf.push(b);

        if capture.in_string {
            if capture.escaped {
                capture.escaped = false;
            } else if b == b'\\' {
                capture.escaped = true;
            } else if b == b'"' {
                capture.in_string = false;
            }
            return Ok(());
        }

        match b {
            b'"' => capture.in_string = true,
            b'{' | b'[' => capture.depth += 1,
            b'}' | b']' => capture.depth -= 1,
            _ => {}
        }

        if capture.depth == 0 {
            let buf = std::mem::take(&mut capture.buf);
            self.capture = None;
            let item = serde_json::from_slice(&buf)
                .map_err(|err| self.error(format!("invalid item: {err}")))?;
            self.ready.push_back(item);
        }
        Ok(())
    }
}
