//! External Term Format <-> json value mapping.
//!
//! The ETF wire form follows the usual chat-client conventions: maps carry
//! binary keys, strings are binaries, `nil`/`true`/`false` are atoms.
//! Integers that do not fit a FixInteger travel as floats; every integral
//! value a frame carries (sequence numbers, counts, intervals) is well
//! under 2^53, so the round trip is exact.

use std::io::Cursor;

use eetf::{Atom, Binary, FixInteger, Float, List, Map, Term, Tuple};
use serde_json::{Map as JsonMap, Number, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EtfError {
    #[error("etf decode: {0}")]
    Decode(#[from] eetf::DecodeError),
    #[error("etf encode: {0}")]
    Encode(#[from] eetf::EncodeError),
    #[error("unrepresentable term: {0}")]
    Unrepresentable(&'static str),
    #[error("non-utf8 binary")]
    BadBinary,
    #[error("non-finite float")]
    BadFloat,
}

pub fn to_bytes(value: &Value) -> Result<Vec<u8>, EtfError> {
    let term = value_to_term(value)?;
    let mut buffer = Vec::new();
    term.encode(&mut buffer)?;
    Ok(buffer)
}

pub fn from_bytes(bytes: &[u8]) -> Result<Value, EtfError> {
    let term = Term::decode(Cursor::new(bytes))?;
    term_to_value(&term)
}

fn value_to_term(value: &Value) -> Result<Term, EtfError> {
    Ok(match value {
        Value::Null => atom("nil"),
        Value::Bool(true) => atom("true"),
        Value::Bool(false) => atom("false"),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                if let Ok(small) = i32::try_from(int) {
                    Term::FixInteger(FixInteger { value: small })
                } else {
                    // exact for |int| < 2^53, which covers every frame field
                    Term::Float(Float { value: int as f64 })
                }
            } else if let Some(uint) = number.as_u64() {
                Term::Float(Float { value: uint as f64 })
            } else {
                let float = number.as_f64().ok_or(EtfError::BadFloat)?;
                Term::Float(Float { value: float })
            }
        }
        Value::String(string) => binary(string),
        Value::Array(items) => {
            let elements = items.iter().map(value_to_term).collect::<Result<Vec<_>, _>>()?;
            Term::List(List { elements })
        }
        Value::Object(fields) => {
            let entries = fields.iter()
                .map(|(key, value)| Ok((binary(key), value_to_term(value)?)))
                .collect::<Result<Vec<_>, EtfError>>()?;
            Term::Map(Map { entries })
        }
    })
}

fn term_to_value(term: &Term) -> Result<Value, EtfError> {
    Ok(match term {
        Term::Atom(Atom { name }) => match name.as_str() {
            "nil" => Value::Null,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            other => Value::String(other.to_string()),
        },
        Term::FixInteger(FixInteger { value }) => Value::Number(Number::from(*value)),
        Term::BigInteger(big) => {
            // frames never carry numbers past i64; anything else is noise
            let parsed: i64 = big.value.to_string().parse()
                .map_err(|_| EtfError::Unrepresentable("big integer"))?;
            Value::Number(Number::from(parsed))
        }
        Term::Float(Float { value }) => {
            if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
                Value::Number(Number::from(*value as i64))
            } else {
                Number::from_f64(*value).map(Value::Number).ok_or(EtfError::BadFloat)?
            }
        }
        Term::Binary(Binary { bytes }) => {
            let text = std::str::from_utf8(bytes).map_err(|_| EtfError::BadBinary)?;
            Value::String(text.to_string())
        }
        Term::List(List { elements }) | Term::Tuple(Tuple { elements }) => {
            let items = elements.iter().map(term_to_value).collect::<Result<Vec<_>, _>>()?;
            Value::Array(items)
        }
        Term::Map(Map { entries }) => {
            let mut fields = JsonMap::with_capacity(entries.len());
            for (key, value) in entries {
                let key = match key {
                    Term::Binary(Binary { bytes }) => std::str::from_utf8(bytes)
                        .map_err(|_| EtfError::BadBinary)?
                        .to_string(),
                    Term::Atom(Atom { name }) => name.clone(),
                    _ => return Err(EtfError::Unrepresentable("non-string map key")),
                };
                fields.insert(key, term_to_value(value)?);
            }
            Value::Object(fields)
        }
        _ => return Err(EtfError::Unrepresentable("pid/port/ref/fun term")),
    })
}

fn atom(name: &str) -> Term {
    Term::Atom(Atom { name: name.to_string() })
}

fn binary(text: &str) -> Term {
    Term::Binary(Binary { bytes: text.as_bytes().to_vec() })
}
