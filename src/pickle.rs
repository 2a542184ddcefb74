//! Read-only decoder for Python pickle streams.
//!
//! Only the part of the pickle machine that numpy array dumps rely on is
//! implemented (protocols 0 to 4). Arrays, dtypes and the `_codecs.encode`
//! byte-string trick are materialized as real values, any other callable
//! becomes an opaque [`Value::Object`].

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read};
use std::rc::Rc;

use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PickleError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unknown opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: u64 },

    #[error("Unsupported opcode {0}")]
    UnsupportedOpcode(&'static str),

    #[error("Stack underflow at {0}")]
    StackUnderflow(&'static str),

    #[error("No mark on the stack for {0}")]
    MissingMark(&'static str),

    #[error("Memo key {0} is not defined")]
    MissingMemo(u32),

    #[error("Invalid operand for {op}: {reason}")]
    InvalidOperand { op: &'static str, reason: String },

    #[error("Stream ended before STOP")]
    MissingStop,

    #[error("Array of dtype '{dtype}' cannot be read as {target}")]
    UnsupportedDtype { dtype: String, target: &'static str },

    #[error("Array payload has {found} bytes, its shape needs {expected}")]
    PayloadSize { expected: usize, found: usize },
}

type PResult<T> = Result<T, PickleError>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Rc<[u8]>),
    Str(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Global { module: String, name: String },
    Dtype(Dtype),
    Array(NdArray),
    Object {
        callable: Box<Value>,
        args: Box<Value>,
        state: Option<Box<Value>>,
    },
}

impl Value {
    /// Text of a `str` or of a Python 2 byte string (read as latin-1).
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Bytes(b) => Some(b.iter().map(|&c| c as char).collect()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Elements of a tuple or a list.
    pub fn as_items(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) | Value::List(items) => Some(items),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Global { .. } => "global",
            Value::Dtype(_) => "dtype",
            Value::Array(_) => "ndarray",
            Value::Object { .. } => "object",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
    Native,
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dtype {
    pub kind: char,
    pub size: usize,
    pub byte_order: ByteOrder,
}

impl Dtype {
    /// Parses a numpy type string such as `f4` or `<i8`.
    pub fn parse(descr: &str) -> Option<Self> {
        let (byte_order, rest) = match descr.chars().next()? {
            '<' => (ByteOrder::Little, &descr[1..]),
            '>' => (ByteOrder::Big, &descr[1..]),
            '|' => (ByteOrder::NotApplicable, &descr[1..]),
            '=' => (ByteOrder::Native, &descr[1..]),
            _ => (ByteOrder::Native, descr),
        };
        let mut chars = rest.chars();
        let kind = chars.next()?;
        let size = chars.as_str().parse().ok()?;
        Some(Dtype { kind, size, byte_order })
    }

    pub fn descr(&self) -> String {
        format!("{}{}", self.kind, self.size)
    }

    pub fn is_little_endian(&self) -> bool {
        match self.byte_order {
            ByteOrder::Big => false,
            ByteOrder::Native => cfg!(target_endian = "little"),
            ByteOrder::Little | ByteOrder::NotApplicable => true,
        }
    }

    // State tuple: (version, byte_order, subarray, names, fields, elsize, alignment, flags)
    fn set_state(&mut self, state: &Value) -> PResult<()> {
        let order = state
            .as_items()
            .and_then(|items| items.get(1))
            .and_then(Value::as_text)
            .ok_or_else(|| invalid("BUILD", format!("dtype state is a {}", state.kind())))?;
        self.byte_order = match order.as_str() {
            "<" => ByteOrder::Little,
            ">" => ByteOrder::Big,
            "|" => ByteOrder::NotApplicable,
            "=" => ByteOrder::Native,
            other => return Err(invalid("BUILD", format!("byte order '{}'", other))),
        };
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    pub fortran_order: bool,
    pub data: Rc<[u8]>,
}

impl NdArray {
    fn empty() -> Self {
        NdArray {
            shape: vec![0],
            dtype: Dtype { kind: 'u', size: 1, byte_order: ByteOrder::NotApplicable },
            fortran_order: false,
            data: Rc::from(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements in storage order, widened or narrowed to `f32`.
    pub fn to_f32(&self) -> PResult<Vec<f32>> {
        match (self.dtype.kind, self.dtype.size) {
            ('f', 4) => Ok(self.words::<4>().map(f32::from_le_bytes).collect()),
            ('f', 8) => Ok(self.words::<8>().map(|w| f64::from_le_bytes(w) as f32).collect()),
            _ => Err(self.unsupported("f32")),
        }
    }

    /// Elements in storage order as `i64`. Unsigned 64-bit values above
    /// `i64::MAX` are rejected.
    pub fn to_i64(&self) -> PResult<Vec<i64>> {
        match (self.dtype.kind, self.dtype.size) {
            ('i', 1) => Ok(self.words::<1>().map(|w| i8::from_le_bytes(w) as i64).collect()),
            ('i', 2) => Ok(self.words::<2>().map(|w| i16::from_le_bytes(w) as i64).collect()),
            ('i', 4) => Ok(self.words::<4>().map(|w| i32::from_le_bytes(w) as i64).collect()),
            ('i', 8) => Ok(self.words::<8>().map(i64::from_le_bytes).collect()),
            ('u', 1) => Ok(self.words::<1>().map(|w| w[0] as i64).collect()),
            ('u', 2) => Ok(self.words::<2>().map(|w| u16::from_le_bytes(w) as i64).collect()),
            ('u', 4) => Ok(self.words::<4>().map(|w| u32::from_le_bytes(w) as i64).collect()),
            ('u', 8) => self
                .words::<8>()
                .map(|w| i64::try_from(u64::from_le_bytes(w)).map_err(|_| self.unsupported("i64")))
                .collect(),
            _ => Err(self.unsupported("i64")),
        }
    }

    // Fixed-size elements, byte-swapped to little endian.
    fn words<const N: usize>(&self) -> impl Iterator<Item = [u8; N]> + '_ {
        let swap = !self.dtype.is_little_endian();
        self.data.chunks_exact(N).map(move |chunk| {
            let mut word = [0u8; N];
            word.copy_from_slice(chunk);
            if swap {
                word.reverse();
            }
            word
        })
    }

    fn unsupported(&self, target: &'static str) -> PickleError {
        PickleError::UnsupportedDtype { dtype: self.dtype.descr(), target }
    }

    // State tuple: ([version,] shape, dtype, is_fortran, raw_data)
    fn set_state(&mut self, state: Value) -> PResult<()> {
        let items = match state {
            Value::Tuple(items) => items,
            other => return Err(invalid("BUILD", format!("ndarray state is a {}", other.kind()))),
        };
        let mut items = match items.len() {
            5 => items.into_iter().skip(1),
            4 => items.into_iter().skip(0),
            n => return Err(invalid("BUILD", format!("ndarray state has {} fields", n))),
        };
        // The length match above guarantees four remaining fields.
        let (shape, dtype, fortran, raw) = match (items.next(), items.next(), items.next(), items.next()) {
            (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
            _ => return Err(invalid("BUILD", "ndarray state is truncated".into())),
        };

        self.shape = shape
            .as_items()
            .ok_or_else(|| invalid("BUILD", format!("ndarray shape is a {}", shape.kind())))?
            .iter()
            .map(|dim| dim.as_int().and_then(|d| usize::try_from(d).ok()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid("BUILD", "ndarray shape holds a non-integer".into()))?;
        self.dtype = match dtype {
            Value::Dtype(dtype) => dtype,
            other => return Err(invalid("BUILD", format!("ndarray dtype is a {}", other.kind()))),
        };
        self.fortran_order = fortran
            .as_bool()
            .ok_or_else(|| invalid("BUILD", format!("ndarray order flag is a {}", fortran.kind())))?;
        self.data = match raw {
            Value::Bytes(bytes) => bytes,
            Value::Str(text) => Rc::from(latin1_bytes("BUILD", &text)?),
            other => {
                return Err(invalid("BUILD", format!("ndarray payload is a {} (object arrays are not supported)", other.kind())))
            }
        };

        let expected = self.len() * self.dtype.size;
        if self.data.len() != expected {
            return Err(PickleError::PayloadSize { expected, found: self.data.len() });
        }
        Ok(())
    }
}

// Opcodes, protocol 0 and 1
const MARK: u8 = b'(';
const STOP: u8 = b'.';
const POP: u8 = b'0';
const POP_MARK: u8 = b'1';
const DUP: u8 = b'2';
const FLOAT: u8 = b'F';
const INT: u8 = b'I';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const LONG: u8 = b'L';
const BININT2: u8 = b'M';
const NONE: u8 = b'N';
const PERSID: u8 = b'P';
const BINPERSID: u8 = b'Q';
const REDUCE: u8 = b'R';
const STRING: u8 = b'S';
const BINSTRING: u8 = b'T';
const SHORT_BINSTRING: u8 = b'U';
const UNICODE: u8 = b'V';
const BINUNICODE: u8 = b'X';
const APPEND: u8 = b'a';
const BUILD: u8 = b'b';
const GLOBAL: u8 = b'c';
const DICT: u8 = b'd';
const EMPTY_DICT: u8 = b'}';
const APPENDS: u8 = b'e';
const GET: u8 = b'g';
const BINGET: u8 = b'h';
const INST: u8 = b'i';
const LONG_BINGET: u8 = b'j';
const LIST: u8 = b'l';
const EMPTY_LIST: u8 = b']';
const OBJ: u8 = b'o';
const PUT: u8 = b'p';
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';
const SETITEM: u8 = b's';
const TUPLE: u8 = b't';
const EMPTY_TUPLE: u8 = b')';
const SETITEMS: u8 = b'u';
const BINFLOAT: u8 = b'G';
// Protocol 2
const PROTO: u8 = 0x80;
const NEWOBJ: u8 = 0x81;
const EXT1: u8 = 0x82;
const EXT2: u8 = 0x83;
const EXT4: u8 = 0x84;
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const LONG1: u8 = 0x8a;
const LONG4: u8 = 0x8b;
// Protocol 3
const BINBYTES: u8 = b'B';
const SHORT_BINBYTES: u8 = b'C';
// Protocol 4
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE8: u8 = 0x8d;
const BINBYTES8: u8 = 0x8e;
const EMPTY_SET: u8 = 0x8f;
const ADDITEMS: u8 = 0x90;
const FROZENSET: u8 = 0x91;
const NEWOBJ_EX: u8 = 0x92;
const STACK_GLOBAL: u8 = 0x93;
const MEMOIZE: u8 = 0x94;
const FRAME: u8 = 0x95;

/// Decodes one pickled object from `reader`.
pub fn from_reader<R: Read>(reader: R) -> PResult<Value> {
    Unpickler::new(BufReader::new(reader)).run()
}

pub fn from_slice(bytes: &[u8]) -> PResult<Value> {
    Unpickler::new(bytes).run()
}

struct Slot {
    value: Value,
    memo_keys: Vec<u32>,
}

// A memoized object stays on the stack (and mutable) until it is popped;
// only then is a copy stored in the memo.
enum Memo {
    OnStack(usize),
    Detached(Value),
}

struct Unpickler<R> {
    reader: R,
    offset: u64,
    stack: Vec<Slot>,
    marks: Vec<usize>,
    memo: HashMap<u32, Memo>,
}

impl<R: BufRead> Unpickler<R> {
    fn new(reader: R) -> Self {
        Unpickler {
            reader,
            offset: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn run(mut self) -> PResult<Value> {
        loop {
            let offset = self.offset;
            let opcode = match self.read_opcode()? {
                Some(opcode) => opcode,
                None => return Err(PickleError::MissingStop),
            };
            match opcode {
                PROTO => {
                    let version = self.read_u8()?;
                    debug!("pickle protocol {}", version);
                }
                FRAME => {
                    self.read_array::<8>()?;
                }
                STOP => return self.pop("STOP"),

                MARK => self.marks.push(self.stack.len()),
                POP => {
                    if self.marks.last() == Some(&self.stack.len()) {
                        self.marks.pop();
                    } else {
                        self.pop("POP")?;
                    }
                }
                POP_MARK => {
                    self.pop_mark("POP_MARK")?;
                }
                DUP => {
                    let value = self.top_mut("DUP")?.clone();
                    self.push(value);
                }

                NONE => self.push(Value::None),
                NEWTRUE => self.push(Value::Bool(true)),
                NEWFALSE => self.push(Value::Bool(false)),
                INT => {
                    let line = self.read_text_line("INT")?;
                    let value = match line.as_str() {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        text => Value::Int(parse_int("INT", text)?),
                    };
                    self.push(value);
                }
                BININT => {
                    let value = i32::from_le_bytes(self.read_array()?);
                    self.push(Value::Int(value as i64));
                }
                BININT1 => {
                    let value = self.read_u8()?;
                    self.push(Value::Int(value as i64));
                }
                BININT2 => {
                    let value = u16::from_le_bytes(self.read_array()?);
                    self.push(Value::Int(value as i64));
                }
                LONG => {
                    let line = self.read_text_line("LONG")?;
                    let text = line.strip_suffix('L').unwrap_or(&line);
                    self.push(Value::Int(parse_int("LONG", text)?));
                }
                LONG1 => {
                    let len = self.read_u8()? as usize;
                    let bytes = self.read_bytes("LONG1", len)?;
                    self.push(Value::Int(decode_long(&bytes)?));
                }
                LONG4 => {
                    let len = self.read_len_i32("LONG4")?;
                    let bytes = self.read_bytes("LONG4", len)?;
                    self.push(Value::Int(decode_long(&bytes)?));
                }
                FLOAT => {
                    let line = self.read_text_line("FLOAT")?;
                    let value = line
                        .parse()
                        .map_err(|_| invalid("FLOAT", format!("'{}' is not a float", line)))?;
                    self.push(Value::Float(value));
                }
                BINFLOAT => {
                    let value = f64::from_be_bytes(self.read_array()?);
                    self.push(Value::Float(value));
                }

                STRING => {
                    let line = self.read_line()?;
                    let bytes = unquote_string(&line)?;
                    self.push(Value::Bytes(Rc::from(bytes)));
                }
                BINSTRING => {
                    let len = self.read_len_i32("BINSTRING")?;
                    let bytes = self.read_bytes("BINSTRING", len)?;
                    self.push(Value::Bytes(Rc::from(bytes)));
                }
                SHORT_BINSTRING | SHORT_BINBYTES => {
                    let len = self.read_u8()? as usize;
                    let bytes = self.read_bytes("SHORT_BINSTRING", len)?;
                    self.push(Value::Bytes(Rc::from(bytes)));
                }
                BINBYTES => {
                    let len = u32::from_le_bytes(self.read_array()?) as usize;
                    let bytes = self.read_bytes("BINBYTES", len)?;
                    self.push(Value::Bytes(Rc::from(bytes)));
                }
                BINBYTES8 => {
                    let len = self.read_len_u64("BINBYTES8")?;
                    let bytes = self.read_bytes("BINBYTES8", len)?;
                    self.push(Value::Bytes(Rc::from(bytes)));
                }
                UNICODE => {
                    let line = self.read_line()?;
                    self.push(Value::Str(decode_raw_unicode_escape(&line)?));
                }
                BINUNICODE => {
                    let len = u32::from_le_bytes(self.read_array()?) as usize;
                    let text = self.read_utf8("BINUNICODE", len)?;
                    self.push(Value::Str(text));
                }
                SHORT_BINUNICODE => {
                    let len = self.read_u8()? as usize;
                    let text = self.read_utf8("SHORT_BINUNICODE", len)?;
                    self.push(Value::Str(text));
                }
                BINUNICODE8 => {
                    let len = self.read_len_u64("BINUNICODE8")?;
                    let text = self.read_utf8("BINUNICODE8", len)?;
                    self.push(Value::Str(text));
                }

                EMPTY_TUPLE => self.push(Value::Tuple(Vec::new())),
                TUPLE => {
                    let items = self.pop_mark("TUPLE")?;
                    self.push(Value::Tuple(items));
                }
                TUPLE1 | TUPLE2 | TUPLE3 => {
                    let count = (opcode - TUPLE1 + 1) as usize;
                    let mut items = Vec::with_capacity(count);
                    for _ in 0..count {
                        items.push(self.pop("TUPLE")?);
                    }
                    items.reverse();
                    self.push(Value::Tuple(items));
                }
                EMPTY_LIST => self.push(Value::List(Vec::new())),
                LIST => {
                    let items = self.pop_mark("LIST")?;
                    self.push(Value::List(items));
                }
                APPEND => {
                    let item = self.pop("APPEND")?;
                    self.extend_list("APPEND", vec![item])?;
                }
                APPENDS => {
                    let items = self.pop_mark("APPENDS")?;
                    self.extend_list("APPENDS", items)?;
                }
                EMPTY_DICT => self.push(Value::Dict(Vec::new())),
                DICT => {
                    let items = self.pop_mark("DICT")?;
                    let mut entries = Vec::new();
                    insert_pairs("DICT", &mut entries, items)?;
                    self.push(Value::Dict(entries));
                }
                SETITEM => {
                    let value = self.pop("SETITEM")?;
                    let key = self.pop("SETITEM")?;
                    self.extend_dict("SETITEM", vec![key, value])?;
                }
                SETITEMS => {
                    let items = self.pop_mark("SETITEMS")?;
                    self.extend_dict("SETITEMS", items)?;
                }
                EMPTY_SET => self.push(Value::Set(Vec::new())),
                ADDITEMS => {
                    let items = self.pop_mark("ADDITEMS")?;
                    match self.top_mut("ADDITEMS")? {
                        Value::Set(set) => set.extend(items),
                        other => return Err(invalid("ADDITEMS", format!("target is a {}", other.kind()))),
                    }
                }
                FROZENSET => {
                    let items = self.pop_mark("FROZENSET")?;
                    self.push(Value::Set(items));
                }

                GLOBAL => {
                    let module = self.read_text_line("GLOBAL")?;
                    let name = self.read_text_line("GLOBAL")?;
                    self.push(Value::Global { module, name });
                }
                STACK_GLOBAL => {
                    let name = self.pop("STACK_GLOBAL")?;
                    let module = self.pop("STACK_GLOBAL")?;
                    match (module, name) {
                        (Value::Str(module), Value::Str(name)) => self.push(Value::Global { module, name }),
                        (module, name) => {
                            return Err(invalid(
                                "STACK_GLOBAL",
                                format!("expected two str, got {} and {}", module.kind(), name.kind()),
                            ))
                        }
                    }
                }
                REDUCE => {
                    let args = self.pop("REDUCE")?;
                    let callable = self.pop("REDUCE")?;
                    let value = reduce(callable, args)?;
                    self.push(value);
                }
                NEWOBJ => {
                    let args = self.pop("NEWOBJ")?;
                    let class = self.pop("NEWOBJ")?;
                    self.push(Value::Object { callable: Box::new(class), args: Box::new(args), state: None });
                }
                NEWOBJ_EX => {
                    let _kwargs = self.pop("NEWOBJ_EX")?;
                    let args = self.pop("NEWOBJ_EX")?;
                    let class = self.pop("NEWOBJ_EX")?;
                    self.push(Value::Object { callable: Box::new(class), args: Box::new(args), state: None });
                }
                BUILD => {
                    let state = self.pop("BUILD")?;
                    build(self.top_mut("BUILD")?, state)?;
                }

                PUT => {
                    let line = self.read_text_line("PUT")?;
                    let key = parse_memo_key("PUT", &line)?;
                    self.memoize(key)?;
                }
                BINPUT => {
                    let key = self.read_u8()? as u32;
                    self.memoize(key)?;
                }
                LONG_BINPUT => {
                    let key = u32::from_le_bytes(self.read_array()?);
                    self.memoize(key)?;
                }
                MEMOIZE => {
                    let key = self.memo.len() as u32;
                    self.memoize(key)?;
                }
                GET => {
                    let line = self.read_text_line("GET")?;
                    let key = parse_memo_key("GET", &line)?;
                    self.recall(key)?;
                }
                BINGET => {
                    let key = self.read_u8()? as u32;
                    self.recall(key)?;
                }
                LONG_BINGET => {
                    let key = u32::from_le_bytes(self.read_array()?);
                    self.recall(key)?;
                }

                PERSID | BINPERSID => return Err(PickleError::UnsupportedOpcode("PERSID")),
                INST | OBJ => return Err(PickleError::UnsupportedOpcode("INST/OBJ")),
                EXT1 | EXT2 | EXT4 => return Err(PickleError::UnsupportedOpcode("EXT")),
                _ => return Err(PickleError::UnknownOpcode { opcode, offset }),
            }
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(Slot { value, memo_keys: Vec::new() });
    }

    // Lowest stack index the current mark frame may touch.
    fn floor(&self) -> usize {
        self.marks.last().copied().unwrap_or(0)
    }

    fn pop(&mut self, op: &'static str) -> PResult<Value> {
        if self.stack.len() <= self.floor() {
            return Err(PickleError::StackUnderflow(op));
        }
        let index = self.stack.len() - 1;
        let slot = self.stack.pop().ok_or(PickleError::StackUnderflow(op))?;
        self.detach(index, &slot);
        Ok(slot.value)
    }

    fn pop_mark(&mut self, op: &'static str) -> PResult<Vec<Value>> {
        let start = self.marks.pop().ok_or(PickleError::MissingMark(op))?;
        let slots = self.stack.split_off(start);
        for (i, slot) in slots.iter().enumerate() {
            self.detach(start + i, slot);
        }
        Ok(slots.into_iter().map(|slot| slot.value).collect())
    }

    fn top_mut(&mut self, op: &'static str) -> PResult<&mut Value> {
        if self.stack.len() <= self.floor() {
            return Err(PickleError::StackUnderflow(op));
        }
        self.stack
            .last_mut()
            .map(|slot| &mut slot.value)
            .ok_or(PickleError::StackUnderflow(op))
    }

    fn detach(&mut self, index: usize, slot: &Slot) {
        for key in &slot.memo_keys {
            if matches!(self.memo.get(key), Some(Memo::OnStack(i)) if *i == index) {
                self.memo.insert(*key, Memo::Detached(slot.value.clone()));
            }
        }
    }

    fn memoize(&mut self, key: u32) -> PResult<()> {
        if self.stack.len() <= self.floor() {
            return Err(PickleError::StackUnderflow("PUT"));
        }
        let index = self.stack.len() - 1;
        self.stack[index].memo_keys.push(key);
        self.memo.insert(key, Memo::OnStack(index));
        Ok(())
    }

    fn recall(&mut self, key: u32) -> PResult<()> {
        let value = match self.memo.get(&key) {
            Some(Memo::OnStack(index)) => self.stack[*index].value.clone(),
            Some(Memo::Detached(value)) => value.clone(),
            None => return Err(PickleError::MissingMemo(key)),
        };
        self.push(value);
        Ok(())
    }

    fn extend_list(&mut self, op: &'static str, items: Vec<Value>) -> PResult<()> {
        match self.top_mut(op)? {
            Value::List(list) => {
                list.extend(items);
                Ok(())
            }
            other => Err(invalid(op, format!("target is a {}", other.kind()))),
        }
    }

    fn extend_dict(&mut self, op: &'static str, items: Vec<Value>) -> PResult<()> {
        match self.top_mut(op)? {
            Value::Dict(entries) => insert_pairs(op, entries, items),
            other => Err(invalid(op, format!("target is a {}", other.kind()))),
        }
    }

    fn read_opcode(&mut self) -> PResult<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.reader.read(&mut byte)? {
            0 => Ok(None),
            _ => {
                self.offset += 1;
                Ok(Some(byte[0]))
            }
        }
    }

    fn read_u8(&mut self) -> PResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_array<const N: usize>(&mut self) -> PResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.reader.read_exact(&mut buf)?;
        self.offset += N as u64;
        Ok(buf)
    }

    // Reads through `take` so a corrupt length cannot trigger a huge allocation.
    fn read_bytes(&mut self, op: &'static str, len: usize) -> PResult<Vec<u8>> {
        let mut buf = Vec::new();
        (&mut self.reader).take(len as u64).read_to_end(&mut buf)?;
        self.offset += buf.len() as u64;
        if buf.len() != len {
            return Err(PickleError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} needs {} bytes, stream has {}", op, len, buf.len()),
            )));
        }
        Ok(buf)
    }

    fn read_utf8(&mut self, op: &'static str, len: usize) -> PResult<String> {
        let bytes = self.read_bytes(op, len)?;
        String::from_utf8(bytes).map_err(|e| invalid(op, e.to_string()))
    }

    fn read_len_i32(&mut self, op: &'static str) -> PResult<usize> {
        let len = i32::from_le_bytes(self.read_array()?);
        usize::try_from(len).map_err(|_| invalid(op, format!("negative length {}", len)))
    }

    fn read_len_u64(&mut self, op: &'static str) -> PResult<usize> {
        let len = u64::from_le_bytes(self.read_array()?);
        usize::try_from(len).map_err(|_| invalid(op, format!("length {} does not fit in memory", len)))
    }

    fn read_line(&mut self) -> PResult<Vec<u8>> {
        let mut line = Vec::new();
        self.reader.read_until(b'\n', &mut line)?;
        self.offset += line.len() as u64;
        if line.pop() != Some(b'\n') {
            return Err(PickleError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unterminated text operand",
            )));
        }
        Ok(line)
    }

    fn read_text_line(&mut self, op: &'static str) -> PResult<String> {
        let line = self.read_line()?;
        String::from_utf8(line).map_err(|e| invalid(op, e.to_string()))
    }
}

fn reduce(callable: Value, args: Value) -> PResult<Value> {
    if let (Value::Global { module, name }, Some(items)) = (&callable, args.as_items()) {
        match (module.as_str(), name.as_str()) {
            ("numpy.core.multiarray" | "numpy._core.multiarray", "_reconstruct") => {
                return Ok(Value::Array(NdArray::empty()));
            }
            ("numpy", "dtype") => {
                let descr = items
                    .first()
                    .and_then(Value::as_text)
                    .ok_or_else(|| invalid("REDUCE", "numpy.dtype without a type string".into()))?;
                let dtype = Dtype::parse(&descr)
                    .ok_or_else(|| invalid("REDUCE", format!("dtype '{}'", descr)))?;
                return Ok(Value::Dtype(dtype));
            }
            ("_codecs", "encode") => {
                if let Some(Value::Str(text)) = items.first() {
                    let encoding = items.get(1).and_then(Value::as_text).unwrap_or_default();
                    let bytes = match encoding.as_str() {
                        "latin1" | "latin-1" | "iso-8859-1" => latin1_bytes("REDUCE", text)?,
                        _ => text.as_bytes().to_vec(),
                    };
                    return Ok(Value::Bytes(Rc::from(bytes)));
                }
            }
            _ => {}
        }
    }
    debug!("keeping opaque object for {:?}", callable);
    Ok(Value::Object { callable: Box::new(callable), args: Box::new(args), state: None })
}

fn build(target: &mut Value, state: Value) -> PResult<()> {
    match target {
        Value::Array(array) => array.set_state(state),
        Value::Dtype(dtype) => dtype.set_state(&state),
        Value::Object { state: slot, .. } => {
            *slot = Some(Box::new(state));
            Ok(())
        }
        other => Err(invalid("BUILD", format!("target is a {}", other.kind()))),
    }
}

fn insert_pairs(op: &'static str, entries: &mut Vec<(Value, Value)>, items: Vec<Value>) -> PResult<()> {
    if items.len() % 2 != 0 {
        return Err(invalid(op, format!("odd number of items ({})", items.len())));
    }
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }
    Ok(())
}

fn invalid(op: &'static str, reason: String) -> PickleError {
    PickleError::InvalidOperand { op, reason }
}

fn parse_int(op: &'static str, text: &str) -> PResult<i64> {
    text.trim()
        .parse()
        .map_err(|_| invalid(op, format!("'{}' is not a 64-bit integer", text)))
}

fn parse_memo_key(op: &'static str, text: &str) -> PResult<u32> {
    text.trim()
        .parse()
        .map_err(|_| invalid(op, format!("'{}' is not a memo key", text)))
}

// Little-endian two's complement.
fn decode_long(bytes: &[u8]) -> PResult<i64> {
    let Some(&last) = bytes.last() else {
        return Ok(0);
    };
    if bytes.len() > 8 {
        return Err(invalid("LONG", format!("{}-byte integer does not fit in 64 bits", bytes.len())));
    }
    let mut word = if last & 0x80 != 0 { [0xff; 8] } else { [0; 8] };
    word[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(word))
}

fn latin1_bytes(op: &'static str, text: &str) -> PResult<Vec<u8>> {
    text.chars()
        .map(|c| u8::try_from(c as u32).map_err(|_| invalid(op, format!("'{}' is not latin-1", c))))
        .collect()
}

// Operand of STRING: a Python repr, quoted with ' or ".
fn unquote_string(line: &[u8]) -> PResult<Vec<u8>> {
    match line.first() {
        Some(&q @ (b'\'' | b'"')) if line.len() >= 2 && line[line.len() - 1] == q => {}
        _ => return Err(invalid("STRING", "operand is not quoted".into())),
    }
    let body = &line[1..line.len() - 1];

    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let c = body[i];
        i += 1;
        if c != b'\\' {
            out.push(c);
            continue;
        }
        let escaped = *body
            .get(i)
            .ok_or_else(|| invalid("STRING", "dangling backslash".into()))?;
        i += 1;
        match escaped {
            b'\\' | b'\'' | b'"' => out.push(escaped),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'\n' => {}
            b'x' => {
                let hex = body
                    .get(i..i + 2)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| invalid("STRING", "bad \\x escape".into()))?;
                out.push(hex);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = (escaped - b'0') as u32;
                let mut digits = 1;
                while digits < 3 && i < body.len() && (b'0'..=b'7').contains(&body[i]) {
                    value = value * 8 + (body[i] - b'0') as u32;
                    i += 1;
                    digits += 1;
                }
                out.push((value & 0xff) as u8);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

// Operand of UNICODE: latin-1 bytes with \uXXXX and \UXXXXXXXX escapes.
fn decode_raw_unicode_escape(line: &[u8]) -> PResult<String> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let c = line[i];
        let width = match (c, line.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            _ => 0,
        };
        if width == 0 {
            out.push(c as char);
            i += 1;
            continue;
        }
        let decoded = line
            .get(i + 2..i + 2 + width)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u32::from_str_radix(h, 16).ok())
            .and_then(char::from_u32)
            .ok_or_else(|| invalid("UNICODE", "bad unicode escape".into()))?;
        out.push(decoded);
        i += 2 + width;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(data: &[u8]) -> Value {
        Value::Bytes(Rc::from(data))
    }

    #[test]
    fn protocol_0_scalars_and_containers() {
        // pickle.dumps((1, 'ab', [2.5, None]), protocol=0)
        let stream = b"(I1\nS'ab'\np0\n(lp1\nF2.5\naNatp2\n.";
        let value = from_slice(stream).unwrap();
        assert_eq!(
            value,
            Value::Tuple(vec![
                Value::Int(1),
                bytes(b"ab"),
                Value::List(vec![Value::Float(2.5), Value::None]),
            ])
        );
    }

    #[test]
    fn protocol_2_dict_and_memo() {
        // {'k': [1, 2], 'j': <same list>}
        let stream = b"\x80\x02}q\x00(X\x01\x00\x00\x00kq\x01]q\x02(K\x01K\x02eX\x01\x00\x00\x00jq\x03h\x02u.";
        let value = from_slice(stream).unwrap();
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(
            value,
            Value::Dict(vec![
                (Value::Str("k".into()), list.clone()),
                (Value::Str("j".into()), list),
            ])
        );
    }

    #[test]
    fn memo_sees_mutations_made_after_put() {
        // x = []; x.append(7); (x, x) with APPEND after BINPUT
        let stream = b"\x80\x02]q\x00K\x07ah\x00\x86.";
        let value = from_slice(stream).unwrap();
        let list = Value::List(vec![Value::Int(7)]);
        assert_eq!(value, Value::Tuple(vec![list.clone(), list]));
    }

    #[test]
    fn integers_of_every_width() {
        let stream = b"\x80\x02(J\xfe\xff\xff\xffM\x00\x01\x8a\x02\x00\x80\x8a\x00L12L\nI01\ntq\x00.";
        let value = from_slice(stream).unwrap();
        assert_eq!(
            value,
            Value::Tuple(vec![
                Value::Int(-2),
                Value::Int(256),
                Value::Int(-32768),
                Value::Int(0),
                Value::Int(12),
                Value::Bool(true),
            ])
        );
    }

    #[test]
    fn numpy_array_from_protocol_2() {
        // numpy.array([1.0, 0.5], dtype='float32') as written by Python 2
        let mut stream = Vec::new();
        stream.extend_from_slice(b"\x80\x02cnumpy.core.multiarray\n_reconstruct\nq\x01cnumpy\nndarray\nq\x02");
        stream.extend_from_slice(b"K\x00\x85q\x03U\x01b\x87q\x04Rq\x05(K\x01K\x02\x85q\x06");
        stream.extend_from_slice(b"cnumpy\ndtype\nq\x07U\x02f4K\x00K\x01\x87Rq\x08");
        stream.extend_from_slice(b"(K\x03U\x01<NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tb");
        stream.extend_from_slice(b"\x89U\x08");
        stream.extend_from_slice(&1.0f32.to_le_bytes());
        stream.extend_from_slice(&0.5f32.to_le_bytes());
        stream.extend_from_slice(b"tb.");

        let array = match from_slice(&stream).unwrap() {
            Value::Array(array) => array,
            other => panic!("expected an array, got {:?}", other),
        };
        assert_eq!(array.shape, vec![2]);
        assert_eq!(array.dtype.descr(), "f4");
        assert!(!array.fortran_order);
        assert_eq!(array.to_f32().unwrap(), vec![1.0, 0.5]);
        assert!(array.to_i64().is_err());
    }

    #[test]
    fn numpy_array_from_protocol_4() {
        // Python 3 layout: FRAME, STACK_GLOBAL, MEMOIZE, SHORT_BINUNICODE,
        // SHORT_BINBYTES and a BINBYTES payload
        let mut stream = Vec::new();
        stream.extend_from_slice(b"\x80\x04\x95\x95\x00\x00\x00\x00\x00\x00\x00");
        stream.extend_from_slice(b"\x8c\x15numpy.core.multiarray\x94\x8c\x0c_reconstruct\x94\x93\x94");
        stream.extend_from_slice(b"\x8c\x05numpy\x94\x8c\x07ndarray\x94\x93\x94");
        stream.extend_from_slice(b"K\x00\x85\x94C\x01b\x94\x87\x94R\x94");
        stream.extend_from_slice(b"(K\x01K\x02\x85\x94h\x03\x8c\x05dtype\x94\x93\x94");
        stream.extend_from_slice(b"\x8c\x02f4\x94K\x00K\x01\x87\x94R\x94");
        stream.extend_from_slice(b"(K\x03\x8c\x01<\x94NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00t\x94b");
        stream.extend_from_slice(b"\x89B\x08\x00\x00\x00");
        stream.extend_from_slice(&0.25f32.to_le_bytes());
        stream.extend_from_slice(&(-3.0f32).to_le_bytes());
        stream.extend_from_slice(b"\x94t\x94b.");

        let array = match from_slice(&stream).unwrap() {
            Value::Array(array) => array,
            other => panic!("expected an array, got {:?}", other),
        };
        assert_eq!(array.shape, vec![2]);
        assert_eq!(array.dtype.byte_order, ByteOrder::Little);
        assert_eq!(array.to_f32().unwrap(), vec![0.25, -3.0]);
    }

    #[test]
    fn big_endian_and_double_floats() {
        let be = NdArray {
            shape: vec![2],
            dtype: Dtype::parse(">f4").unwrap(),
            fortran_order: false,
            data: Rc::from([0.5f32.to_be_bytes(), (-1.5f32).to_be_bytes()].concat()),
        };
        assert_eq!(be.to_f32().unwrap(), vec![0.5, -1.5]);

        let double = NdArray {
            shape: vec![1],
            dtype: Dtype::parse("<f8").unwrap(),
            fortran_order: false,
            data: Rc::from(0.125f64.to_le_bytes().to_vec()),
        };
        assert_eq!(double.to_f32().unwrap(), vec![0.125]);
    }

    #[test]
    fn codecs_encode_yields_latin1_bytes() {
        let stream = b"\x80\x02c_codecs\nencode\nX\x02\x00\x00\x00\xc3\xbfX\x06\x00\x00\x00latin1\x86R.";
        assert_eq!(from_slice(stream).unwrap(), bytes(&[0xff]));
    }

    #[test]
    fn big_endian_labels() {
        let array = NdArray {
            shape: vec![2],
            dtype: Dtype::parse(">i2").unwrap(),
            fortran_order: false,
            data: Rc::from(vec![0x00, 0x07, 0xff, 0xfe]),
        };
        assert_eq!(array.to_i64().unwrap(), vec![7, -2]);
    }

    #[test]
    fn string_escapes() {
        assert_eq!(unquote_string(br"'a\'b\x41\n'").unwrap(), b"a'bA\n");
        assert_eq!(unquote_string(br#""\\0""#).unwrap(), b"\\0");
        assert!(unquote_string(b"abc").is_err());
        assert_eq!(decode_raw_unicode_escape(b"x\xe9").unwrap(), "x\u{e9}");
    }

    #[test]
    fn malformed_streams() {
        assert!(matches!(from_slice(b"\x80\x02K\x01"), Err(PickleError::MissingStop)));
        assert!(matches!(from_slice(b"."), Err(PickleError::StackUnderflow("STOP"))));
        assert!(matches!(from_slice(b"t."), Err(PickleError::MissingMark("TUPLE"))));
        assert!(matches!(from_slice(b"h\x05."), Err(PickleError::MissingMemo(5))));
        assert!(matches!(
            from_slice(b"\xff."),
            Err(PickleError::UnknownOpcode { opcode: 0xff, offset: 0 })
        ));
        assert!(matches!(from_slice(b"T\x10\x00\x00\x00abc"), Err(PickleError::Io(_))));
    }
}
