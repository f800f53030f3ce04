use serde_json::Value;
use syncline_core::error::SyncError;
use syncline_core::spec::{FieldKind, FieldSpec};
use syncline_core::value::Row;

/// The gateway's null marker, a single U+00F1 code point.
pub const NULL_SENTINEL: char = '\u{00F1}';

fn strip_bom(response: &str) -> &str {
    response.strip_prefix('\u{feff}').unwrap_or(response)
}

fn is_null_marker(raw: &str) -> bool {
    raw.is_empty() || raw.chars().eq(std::iter::once(NULL_SENTINEL))
}

/// First `<tag>…</tag>` occurrence inside `slice`, or None when absent.
/// A tag that opens but never closes means the response was cut short.
fn extract_tag<'a>(slice: &'a str, tag: &str) -> Result<Option<&'a str>, ()> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let Some(start) = slice.find(&open) else {
        return Ok(None);
    };
    let value_start = start + open.len();
    match slice[value_start..].find(&close) {
        Some(length) => Ok(Some(&slice[value_start..value_start + length])),
        None => Err(()),
    }
}

fn coerce(raw: Option<&str>, kind: FieldKind) -> Value {
    let raw = raw.filter(|value| !is_null_marker(value));
    match kind {
        FieldKind::Text => Value::String(raw.unwrap_or("").to_string()),
        FieldKind::Logical => {
            let truthy = matches!(raw, Some("Yes" | "1" | "true" | "True"));
            Value::from(i64::from(truthy))
        }
        FieldKind::Number | FieldKind::Amount | FieldKind::Quantity | FieldKind::Rate => {
            let parsed = raw
                .and_then(|value| value.trim().parse::<f64>().ok())
                .unwrap_or(0.0);
            Value::from(parsed)
        }
        FieldKind::Date => match raw.and_then(parse_gateway_date) {
            Some(iso) => Value::String(iso),
            None => Value::Null,
        },
    }
}

/// Decodes the gateway's flat positional response into rows.
///
/// The body contains repeated `<F01>…</F01> … <Fnn>…</Fnn>` runs; every
/// `<F01>` opens a new logical row and the tag index is the 1-based column
/// position in field order. Absent tags and the null sentinel decode as null
/// before per-kind coercion.
pub fn decode_rows(response: &str, fields: &[FieldSpec], table: &str) -> Result<Vec<Row>, SyncError> {
    let body = strip_bom(response);

    let mut starts = Vec::new();
    let mut cursor = 0;
    while let Some(found) = body[cursor..].find("<F01>") {
        starts.push(cursor + found);
        cursor += found + 5;
    }
    if starts.is_empty() {
        return Ok(Vec::new());
    }

    let mut rows = Vec::with_capacity(starts.len());
    for (index, &start) in starts.iter().enumerate() {
        let end = starts.get(index + 1).copied().unwrap_or(body.len());
        let slice = &body[start..end];

        let mut row = Row::new();
        for (position, field) in fields.iter().enumerate() {
            let tag = format!("F{:02}", position + 1);
            let raw = extract_tag(slice, &tag).map_err(|()| {
                SyncError::decode(
                    table,
                    format!("tag <{tag}> opened but never closed; response truncated"),
                )
            })?;
            row.insert(field.name.clone(), coerce(raw, field.kind));
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Decoder for the metadata reports that use the gateway's delimited export
/// formats instead of positional tags: comma-separated for the alter-id
/// report, tab-separated in some builds. Fields may arrive quoted; the null
/// sentinel and empty fields decode as null, with no kind coercion.
pub fn decode_delimited(response: &str, columns: &[&str], delimiter: char) -> Vec<Row> {
    let mut rows = Vec::new();
    for line in strip_bom(response).lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let values: Vec<&str> = line
            .split(delimiter)
            .map(|value| value.trim().trim_matches('"'))
            .collect();
        if values.len() < columns.len() {
            continue;
        }
        let mut row = Row::new();
        for (index, column) in columns.iter().enumerate() {
            let raw = values.get(index).copied().unwrap_or("");
            let value = if is_null_marker(raw) {
                Value::Null
            } else {
                Value::String(raw.to_string())
            };
            row.insert((*column).to_string(), value);
        }
        rows.push(row);
    }
    rows
}

const MONTHS: [(&str, &str); 12] = [
    ("jan", "01"),
    ("feb", "02"),
    ("mar", "03"),
    ("apr", "04"),
    ("may", "05"),
    ("jun", "06"),
    ("jul", "07"),
    ("aug", "08"),
    ("sep", "09"),
    ("oct", "10"),
    ("nov", "11"),
    ("dec", "12"),
];

/// Parses the gateway's two date shapes into ISO `YYYY-MM-DD`.
///
/// `YYYYMMDD` and `d-MMM-yy` both occur, the latter sometimes mangled with
/// split month letters and doubled separators (`1-Ap-r--21`). Anything that
/// is not one of the known shapes decodes to None; the engine never guesses
/// a date the gateway did not clearly render.
pub fn parse_gateway_date(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if is_null_marker(trimmed) {
        return None;
    }

    if trimmed.len() == 8 && trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        return Some(format!(
            "{}-{}-{}",
            &trimmed[..4],
            &trimmed[4..6],
            &trimmed[6..8]
        ));
    }

    let cleaned = trimmed
        .replace("--", "-")
        .replace("- ", "-")
        .replace(" -", "-");
    let parts: Vec<&str> = cleaned.split('-').collect();
    if parts.len() < 3 {
        return None;
    }

    let day: u32 = parts[0].parse().ok().filter(|day| (1..=31).contains(day))?;
    // Month letters may be split across separators ("Ap-r"); rejoin the
    // middle segments before matching.
    let month_key: String = parts[1..parts.len() - 1]
        .concat()
        .to_ascii_lowercase()
        .chars()
        .take(3)
        .collect();
    let month = MONTHS
        .iter()
        .find(|(name, _)| *name == month_key)
        .map(|(_, number)| *number)?;

    let year_part = parts[parts.len() - 1];
    let year = match year_part.len() {
        4 => year_part.parse::<u32>().ok()?,
        2 => {
            let short: u32 = year_part.parse().ok()?;
            if short < 50 {
                2000 + short
            } else {
                1900 + short
            }
        }
        _ => return None,
    };

    Some(format!("{year:04}-{month}-{day:02}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use syncline_core::spec::FieldSpec;

    use super::*;

    fn fields(specs: &[(&str, FieldKind)]) -> Vec<FieldSpec> {
        specs
            .iter()
            .map(|(name, kind)| FieldSpec {
                name: (*name).to_string(),
                expr: "X".to_string(),
                kind: *kind,
            })
            .collect()
    }

    #[test]
    fn slices_rows_on_each_f01_occurrence() {
        let fields = fields(&[("guid", FieldKind::Text), ("name", FieldKind::Text)]);
        let body = "\u{feff}<ENVELOPE><F01>g-1</F01><F02>Sales</F02><F01>g-2</F01><F02>Rent</F02></ENVELOPE>";
        let rows = decode_rows(body, &fields, "mst_ledger").expect("decode");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["guid"], json!("g-1"));
        assert_eq!(rows[0]["name"], json!("Sales"));
        assert_eq!(rows[1]["guid"], json!("g-2"));
        assert_eq!(rows[1]["name"], json!("Rent"));
    }

    #[test]
    fn absent_tags_decode_as_nulls() {
        let fields = fields(&[
            ("guid", FieldKind::Text),
            ("balance", FieldKind::Amount),
            ("date", FieldKind::Date),
        ]);
        let rows = decode_rows("<F01>g-1</F01>", &fields, "t").expect("decode");
        assert_eq!(rows[0]["guid"], json!("g-1"));
        assert_eq!(rows[0]["balance"], json!(0.0));
        assert_eq!(rows[0]["date"], Value::Null);
    }

    #[test]
    fn null_sentinel_coerces_per_kind() {
        let fields = fields(&[
            ("name", FieldKind::Text),
            ("flag", FieldKind::Logical),
            ("qty", FieldKind::Quantity),
            ("date", FieldKind::Date),
        ]);
        let body = "<F01>ñ</F01><F02>ñ</F02><F03>ñ</F03><F04>ñ</F04>";
        let rows = decode_rows(body, &fields, "t").expect("decode");
        assert_eq!(rows[0]["name"], json!(""));
        assert_eq!(rows[0]["flag"], json!(0));
        assert_eq!(rows[0]["qty"], json!(0.0));
        assert_eq!(rows[0]["date"], Value::Null);
    }

    #[test]
    fn logical_and_numeric_coercions() {
        let fields = fields(&[
            ("yes", FieldKind::Logical),
            ("no", FieldKind::Logical),
            ("amount", FieldKind::Amount),
            ("bad", FieldKind::Number),
        ]);
        let body = "<F01>Yes</F01><F02>No</F02><F03>-1234.50</F03><F04>12,5</F04>";
        let rows = decode_rows(body, &fields, "t").expect("decode");
        assert_eq!(rows[0]["yes"], json!(1));
        assert_eq!(rows[0]["no"], json!(0));
        assert_eq!(rows[0]["amount"], json!(-1234.5));
        assert_eq!(rows[0]["bad"], json!(0.0), "unparseable numbers become zero");
    }

    #[test]
    fn empty_response_yields_no_rows() {
        let fields = fields(&[("guid", FieldKind::Text)]);
        assert!(decode_rows("", &fields, "t").expect("decode").is_empty());
        assert!(decode_rows("<ENVELOPE></ENVELOPE>", &fields, "t")
            .expect("decode")
            .is_empty());
    }

    #[test]
    fn unclosed_tag_is_a_decode_error() {
        let fields = fields(&[("guid", FieldKind::Text)]);
        let err = decode_rows("<F01>g-1", &fields, "mst_group").expect_err("truncated");
        assert!(matches!(err, SyncError::Decode { ref table, .. } if table == "mst_group"));
    }

    #[test]
    fn date_shapes_decode_to_iso() {
        assert_eq!(parse_gateway_date("20210401").as_deref(), Some("2021-04-01"));
        assert_eq!(parse_gateway_date("1-Apr-21").as_deref(), Some("2021-04-01"));
        assert_eq!(parse_gateway_date("01-Apr-21").as_deref(), Some("2021-04-01"));
        assert_eq!(parse_gateway_date("15-Dec-1998").as_deref(), Some("1998-12-15"));
        assert_eq!(parse_gateway_date("1-Jul-51").as_deref(), Some("1951-07-01"));
    }

    #[test]
    fn mangled_date_shapes_still_decode() {
        assert_eq!(parse_gateway_date("1-Ap-r--21").as_deref(), Some("2021-04-01"));
        assert_eq!(parse_gateway_date("2-Ma-y- 22").as_deref(), Some("2022-05-02"));
    }

    #[test]
    fn unknown_date_shapes_decode_to_null() {
        assert_eq!(parse_gateway_date("ñ"), None);
        assert_eq!(parse_gateway_date(""), None);
        assert_eq!(parse_gateway_date("1-Apr-"), None);
        assert_eq!(parse_gateway_date("yesterday"), None);
        assert_eq!(parse_gateway_date("32-Jan-21"), None);
        assert_eq!(parse_gateway_date("1-Xyz-21"), None);
    }

    #[test]
    fn delimited_decoder_splits_lines_and_maps_sentinel() {
        let body = "ACME\t1\t20240401\t20250331\r\nBETA\tñ\t20240401\t20250331\r\n";
        let rows = decode_delimited(body, &["name", "number", "books_from", "books_to"], '\t');
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], json!("ACME"));
        assert_eq!(rows[1]["number"], Value::Null);
    }

    #[test]
    fn delimited_decoder_strips_quotes_from_comma_exports() {
        let body = "\u{feff}\"120\",\"3456\"\r\n";
        let rows = decode_delimited(body, &["master", "transaction"], ',');
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["master"], json!("120"));
        assert_eq!(rows[0]["transaction"], json!("3456"));
    }
}
