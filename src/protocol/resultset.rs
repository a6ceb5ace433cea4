//! Column definitions and text-protocol rows

use bytes::{Bytes, BytesMut};

use super::wire::{put_lenenc_bytes, read_lenenc_bytes};

/// The naming part of a protocol 4.1 column definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
}

impl ColumnDefinition {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut at = 0;
        let mut next = || -> Option<String> {
            let (value, used) = read_lenenc_bytes(&payload[at..])?;
            at += used;
            Some(String::from_utf8_lossy(value.unwrap_or_default()).into_owned())
        };
        let _catalog = next()?;
        Some(Self {
            schema: next()?,
            table: next()?,
            org_table: next()?,
            name: next()?,
            org_name: next()?,
        })
    }
}

/// Split a text-protocol row into its column values, `None` for NULL
pub fn parse_text_row(payload: &Bytes, columns: usize) -> Option<Vec<Option<Bytes>>> {
    let mut values = Vec::with_capacity(columns);
    let mut at = 0;
    for _ in 0..columns {
        let (value, used) = read_lenenc_bytes(&payload[at..])?;
        let value = value.map(|v| {
            let start = at + used - v.len();
            payload.slice(start..at + used)
        });
        values.push(value);
        at += used;
    }
    (at == payload.len()).then_some(values)
}

pub fn encode_text_row(values: &[Option<Bytes>]) -> Bytes {
    let mut buf = BytesMut::new();
    for value in values {
        put_lenenc_bytes(&mut buf, value.as_deref());
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_payload(schema: &str, table: &str, name: &str) -> Bytes {
        let mut buf = BytesMut::new();
        for part in ["def", schema, table, table, name, name] {
            put_lenenc_bytes(&mut buf, Some(part.as_bytes()));
        }
        buf.extend_from_slice(&[0x0c, 0x21, 0x00, 0xff, 0x00, 0x00, 0x00, 0xfd, 0x00, 0x00, 0x00, 0x00, 0x00]);
        buf.freeze()
    }

    #[test]
    fn test_column_definition_names() {
        let column = ColumnDefinition::parse(&column_payload("shop", "customers", "ssn")).unwrap();
        assert_eq!(column.schema, "shop");
        assert_eq!(column.table, "customers");
        assert_eq!(column.name, "ssn");
    }

    #[test]
    fn test_text_row_with_null() {
        let row = encode_text_row(&[Some(Bytes::from_static(b"42")), None, Some(Bytes::new())]);
        let values = parse_text_row(&row, 3).unwrap();
        assert_eq!(values[0].as_deref(), Some(&b"42"[..]));
        assert_eq!(values[1], None);
        assert_eq!(values[2].as_deref(), Some(&b""[..]));
        assert!(parse_text_row(&row, 2).is_none());
    }
}
