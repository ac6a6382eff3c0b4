//! [`Serializer`] over `serde_json::Value`.
//!
//! The reader never mutates its document: it keeps a stack of path segments
//! from the document root to the current container and walks it on access.
//! Unnamed values inside an array are consumed in order.

use scenery_common::{SerializeMode, Serializer};
use serde_json::{Map, Number, Value};

#[derive(Debug, Clone)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug)]
struct ReadFrame {
    /// How this container is reached from its parent.
    segment: Option<Segment>,
    /// Next unnamed element, for arrays.
    cursor: usize,
}

#[derive(Debug)]
enum WriteFrame {
    Object {
        name: Option<String>,
        map: Map<String, Value>,
    },
    Array {
        name: Option<String>,
        items: Vec<Value>,
    },
}

#[derive(Debug)]
pub struct JsonSerializer {
    mode: SerializeMode,
    /// The document wrapped in a one-element array, so the top-level value
    /// is read like any unnamed element.
    document: Value,
    read: Vec<ReadFrame>,
    write: Vec<WriteFrame>,
    output: Option<Value>,
    error: Option<String>,
}

impl JsonSerializer {
    pub fn writer() -> Self {
        Self {
            mode: SerializeMode::Write,
            document: Value::Null,
            read: Vec::new(),
            write: Vec::new(),
            output: None,
            error: None,
        }
    }

    pub fn reader(document: Value) -> Self {
        Self {
            mode: SerializeMode::Read,
            document: Value::Array(vec![document]),
            read: vec![ReadFrame {
                segment: None,
                cursor: 0,
            }],
            write: Vec::new(),
            output: None,
            error: None,
        }
    }

    /// The written document, once every container has been closed.
    pub fn into_value(self) -> Option<Value> {
        self.output
    }

    pub fn into_error(self) -> Option<String> {
        self.error
    }

    fn locate(&self) -> Option<&Value> {
        let mut value = &self.document;
        for frame in &self.read {
            value = match &frame.segment {
                None => value,
                Some(Segment::Key(key)) => value.get(key)?,
                Some(Segment::Index(index)) => value.get(*index)?,
            };
        }
        Some(value)
    }

    fn next_segment(&self, name: Option<&str>) -> Option<Segment> {
        let frame = self.read.last()?;
        Some(match name {
            Some(name) => Segment::Key(name.to_owned()),
            None => Segment::Index(frame.cursor),
        })
    }

    fn resolve(&self, segment: &Segment) -> Option<&Value> {
        let parent = self.locate()?;
        match segment {
            Segment::Key(key) => parent.as_object()?.get(key),
            Segment::Index(index) => parent.as_array()?.get(*index),
        }
    }

    fn consume(&mut self, segment: &Segment) {
        if let Segment::Index(_) = segment {
            if let Some(frame) = self.read.last_mut() {
                frame.cursor += 1;
            }
        }
    }

    /// Dotted location of `name` inside the document, for messages.
    fn location(&self, name: Option<&str>) -> String {
        let mut path = String::new();
        for frame in self.read.iter().skip(2) {
            match &frame.segment {
                Some(Segment::Key(key)) => {
                    if !path.is_empty() {
                        path.push('.');
                    }
                    path.push_str(key);
                }
                Some(Segment::Index(index)) => path.push_str(&format!("[{index}]")),
                None => {}
            }
        }
        match name {
            Some(name) if path.is_empty() => name.to_owned(),
            Some(name) => format!("{path}.{name}"),
            None => {
                let index = self.read.last().map_or(0, |frame| frame.cursor);
                format!("{path}[{index}]")
            }
        }
    }

    /// Take the next value named `name` (or the next array element).
    fn take(&mut self, name: Option<&str>, expected: &str) -> Option<Value> {
        let location = self.location(name);
        let Some(segment) = self.next_segment(name) else {
            self.report_error(format!("{location}: read past the end of the document"));
            return None;
        };
        let value = self.resolve(&segment).cloned();
        self.consume(&segment);
        if value.is_none() {
            self.report_error(format!("{location}: missing {expected}"));
        }
        value
    }

    fn mismatch(&mut self, name: Option<&str>, expected: &str) -> bool {
        let location = self.location(name);
        self.report_error(format!("{location}: expected {expected}"));
        false
    }

    fn enter(&mut self, name: Option<&str>, array: bool) -> Option<usize> {
        let location = self.location(name);
        let expected = if array { "an array" } else { "an object" };
        let Some(segment) = self.next_segment(name) else {
            self.report_error(format!("{location}: read past the end of the document"));
            return None;
        };
        let len = match self.resolve(&segment) {
            Some(Value::Array(items)) if array => Some(items.len()),
            Some(Value::Object(map)) if !array => Some(map.len()),
            Some(_) => {
                self.report_error(format!("{location}: expected {expected}"));
                None
            }
            None => {
                self.report_error(format!("{location}: missing {expected}"));
                None
            }
        };
        self.consume(&segment);
        if len.is_some() {
            self.read.push(ReadFrame {
                segment: Some(segment),
                cursor: 0,
            });
        }
        len
    }

    fn emit(&mut self, name: Option<&str>, value: Value) -> bool {
        match self.write.last_mut() {
            Some(WriteFrame::Object { map, .. }) => {
                if let Some(name) = name {
                    map.insert(name.to_owned(), value);
                    return true;
                }
            }
            Some(WriteFrame::Array { items, .. }) => {
                items.push(value);
                return true;
            }
            None => {
                self.output = Some(value);
                return true;
            }
        }
        self.report_error("unnamed value written inside an object".to_owned());
        false
    }
}

/// Shortest decimal that reads back as the same `f32`.
fn number_from_f32(value: f32) -> Option<Number> {
    let shortest = value.to_string().parse::<f64>().unwrap_or(f64::from(value));
    Number::from_f64(shortest)
}

impl Serializer for JsonSerializer {
    fn mode(&self) -> SerializeMode {
        self.mode
    }

    fn begin_object(&mut self, name: Option<&str>) -> bool {
        match self.mode {
            SerializeMode::Read => self.enter(name, false).is_some(),
            SerializeMode::Write => {
                self.write.push(WriteFrame::Object {
                    name: name.map(str::to_owned),
                    map: Map::new(),
                });
                true
            }
        }
    }

    fn end_object(&mut self) {
        match self.mode {
            SerializeMode::Read => {
                self.read.pop();
            }
            SerializeMode::Write => {
                if let Some(WriteFrame::Object { name, map }) = self.write.pop() {
                    self.emit(name.as_deref(), Value::Object(map));
                }
            }
        }
    }

    fn begin_array(&mut self, len: &mut usize, name: Option<&str>) -> bool {
        match self.mode {
            SerializeMode::Read => match self.enter(name, true) {
                Some(stored) => {
                    *len = stored;
                    true
                }
                None => false,
            },
            SerializeMode::Write => {
                self.write.push(WriteFrame::Array {
                    name: name.map(str::to_owned),
                    items: Vec::with_capacity(*len),
                });
                true
            }
        }
    }

    fn end_array(&mut self) {
        match self.mode {
            SerializeMode::Read => {
                self.read.pop();
            }
            SerializeMode::Write => {
                if let Some(WriteFrame::Array { name, items }) = self.write.pop() {
                    self.emit(name.as_deref(), Value::Array(items));
                }
            }
        }
    }

    fn has_field(&self, name: &str) -> bool {
        self.mode == SerializeMode::Read
            && self
                .locate()
                .and_then(Value::as_object)
                .is_some_and(|map| map.contains_key(name))
    }

    fn value_bool(&mut self, value: &mut bool, name: Option<&str>) -> bool {
        if self.mode == SerializeMode::Write {
            return self.emit(name, Value::Bool(*value));
        }
        match self.take(name, "a boolean") {
            Some(Value::Bool(read)) => {
                *value = read;
                true
            }
            Some(_) => self.mismatch(name, "a boolean"),
            None => false,
        }
    }

    fn value_u32(&mut self, value: &mut u32, name: Option<&str>) -> bool {
        if self.mode == SerializeMode::Write {
            return self.emit(name, Value::from(*value));
        }
        match self
            .take(name, "an integer")
            .map(|v| v.as_u64().and_then(|n| u32::try_from(n).ok()))
        {
            Some(Some(read)) => {
                *value = read;
                true
            }
            Some(None) => self.mismatch(name, "a 32-bit unsigned integer"),
            None => false,
        }
    }

    fn value_f32(&mut self, value: &mut f32, name: Option<&str>) -> bool {
        if self.mode == SerializeMode::Write {
            return match number_from_f32(*value) {
                Some(number) => self.emit(name, Value::Number(number)),
                None => self.mismatch(name, "a finite number"),
            };
        }
        match self.take(name, "a number").map(|v| v.as_f64()) {
            Some(Some(read)) => {
                *value = read as f32;
                true
            }
            Some(None) => self.mismatch(name, "a number"),
            None => false,
        }
    }

    fn value_string(&mut self, value: &mut String, name: Option<&str>) -> bool {
        if self.mode == SerializeMode::Write {
            return self.emit(name, Value::String(value.clone()));
        }
        match self.take(name, "a string") {
            Some(Value::String(read)) => {
                *value = read;
                true
            }
            Some(_) => self.mismatch(name, "a string"),
            None => false,
        }
    }

    fn value_floats(&mut self, values: &mut [f32], name: Option<&str>) -> bool {
        if self.mode == SerializeMode::Write {
            let items: Option<Vec<Value>> = values
                .iter()
                .map(|v| number_from_f32(*v).map(Value::Number))
                .collect();
            return match items {
                Some(items) => self.emit(name, Value::Array(items)),
                None => self.mismatch(name, "finite numbers"),
            };
        }
        let expected = format!("an array of {} numbers", values.len());
        let Some(read) = self.take(name, &expected) else {
            return false;
        };
        let numbers: Option<Vec<f64>> = read
            .as_array()
            .filter(|items| items.len() == values.len())
            .and_then(|items| items.iter().map(Value::as_f64).collect());
        match numbers {
            Some(numbers) => {
                for (slot, number) in values.iter_mut().zip(numbers) {
                    *slot = number as f32;
                }
                true
            }
            None => self.mismatch(name, &expected),
        }
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn report_error(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }
}
