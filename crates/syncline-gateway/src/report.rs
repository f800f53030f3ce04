use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;
use syncline_core::spec::{FieldKind, TableSpec};

/// Report id used for data-table export requests.
const EXPORT_REPORT_ID: &str = "SynclineExport";

/// Bare attribute identifiers get wrapped by a kind-specific template;
/// anything with operators, function calls, or colons is emitted verbatim.
fn bare_identifier() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\.\.)?[A-Za-z0-9_]+$").expect("static pattern"))
}

/// Position-indexed name, `("Fld", 3)` -> `Fld03`.
fn indexed(prefix: &str, index: usize) -> String {
    format!("{prefix}{index:02}")
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// The gateway wants dates without separators in static variables.
fn compact_date(date: &str) -> String {
    date.replace('-', "")
}

/// Expression template per field kind. The gateway renders empty dates and
/// numbers as its null sentinel / zero so the decoder sees a stable shape;
/// amounts are sign-normalised on the gateway side (debit negative,
/// parenthesised negatives rewritten to a leading minus), quantities are
/// sign-normalised by movement direction with the tail unit stripped.
fn field_expression(expr: &str, kind: FieldKind) -> String {
    if !bare_identifier().is_match(expr) {
        return expr.to_string();
    }
    match kind {
        FieldKind::Text => format!("${expr}"),
        FieldKind::Logical => format!("if ${expr} then 1 else 0"),
        FieldKind::Date => format!(
            "if $$IsEmpty:${expr} then $$StrByCharCode:241 else $$PyrlYYYYMMDDFormat:${expr}:\"-\""
        ),
        FieldKind::Number => format!("if $$IsEmpty:${expr} then \"0\" else $$String:${expr}"),
        FieldKind::Amount => format!(
            "$$StringFindAndReplace:(if $$IsDebit:${expr} then -$$NumValue:${expr} else $$NumValue:${expr}):\"(-)\":\"-\""
        ),
        FieldKind::Quantity => format!(
            "$$StringFindAndReplace:(if $$IsInwards:${expr} then $$Number:$$String:${expr}:\"TailUnits\" else -$$Number:$$String:${expr}:\"TailUnits\"):\"(-)\":\"-\""
        ),
        FieldKind::Rate => format!("if $$IsEmpty:${expr} then 0 else $$Number:${expr}"),
    }
}

/// Reporting window and target company carried into every export request.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub from_date: String,
    pub to_date: String,
}

impl ReportContext {
    pub fn new(from_date: &str, to_date: &str) -> Self {
        Self {
            from_date: from_date.to_string(),
            to_date: to_date.to_string(),
        }
    }

    /// Emits the full report-definition payload for one table spec.
    ///
    /// The dotted collection path becomes a ladder of nested report parts,
    /// each repeating over the previous level; the terminal line carries one
    /// field per spec field. The response tag `Fnn` is positional: its
    /// 1-based index is the column position in field order, which is the
    /// contract the decoder relies on.
    pub fn export_payload(&self, spec: &TableSpec, company: &str) -> String {
        let mut levels: Vec<&str> = spec.collection.split('.').collect();
        let root_collection = levels.remove(0);

        let mut payload = String::with_capacity(2048);
        payload.push_str(concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><ENVELOPE><HEADER><VERSION>1</VERSION>",
            "<TALLYREQUEST>Export</TALLYREQUEST><TYPE>Data</TYPE><ID>",
        ));
        payload.push_str(EXPORT_REPORT_ID);
        payload.push_str(concat!(
            "</ID></HEADER><BODY><DESC><STATICVARIABLES>",
            "<SVEXPORTFORMAT>XML (Data Interchange)</SVEXPORTFORMAT>",
        ));
        let _ = write!(
            payload,
            "<SVFROMDATE>{}</SVFROMDATE><SVTODATE>{}</SVTODATE>",
            compact_date(&self.from_date),
            compact_date(&self.to_date)
        );
        if !company.is_empty() {
            let _ = write!(
                payload,
                "<SVCURRENTCOMPANY>{}</SVCURRENTCOMPANY>",
                escape_xml(company)
            );
        }
        let _ = write!(
            payload,
            "</STATICVARIABLES><TDL><TDLMESSAGE><REPORT NAME=\"{id}\"><FORMS>SynForm</FORMS></REPORT><FORM NAME=\"SynForm\"><PARTS>SynPart01</PARTS></FORM>",
            id = EXPORT_REPORT_ID
        );

        // One part per level; the first repeats over the root collection, the
        // rest walk the remaining path segments.
        let mut routes = vec!["SynCollection"];
        routes.extend(levels.iter().copied());
        for (index, route) in routes.iter().enumerate() {
            let part = indexed("SynPart", index + 1);
            let line = indexed("SynLine", index + 1);
            let _ = write!(
                payload,
                "<PART NAME=\"{part}\"><LINES>{line}</LINES><REPEAT>{line} : {route}</REPEAT><SCROLLED>Vertical</SCROLLED></PART>"
            );
        }

        // Intermediate lines explode into the next part; only the terminal
        // line carries real fields.
        for index in 0..routes.len().saturating_sub(1) {
            let line = indexed("SynLine", index + 1);
            let next_part = indexed("SynPart", index + 2);
            let _ = write!(
                payload,
                "<LINE NAME=\"{line}\"><FIELDS>FldBlank</FIELDS><EXPLODE>{next_part}</EXPLODE></LINE>"
            );
        }

        let terminal_line = indexed("SynLine", routes.len());
        let field_list: Vec<String> = (1..=spec.fields.len())
            .map(|index| indexed("Fld", index))
            .collect();
        let _ = write!(
            payload,
            "<LINE NAME=\"{terminal_line}\"><FIELDS>{}</FIELDS></LINE>",
            field_list.join(",")
        );

        for (index, field) in spec.fields.iter().enumerate() {
            let _ = write!(
                payload,
                "<FIELD NAME=\"{name}\"><SET>{set}</SET><XMLTAG>{tag}</XMLTAG></FIELD>",
                name = indexed("Fld", index + 1),
                set = field_expression(&field.expr, field.kind),
                tag = indexed("F", index + 1)
            );
        }
        payload.push_str("<FIELD NAME=\"FldBlank\"><SET>\"\"</SET></FIELD>");

        let _ = write!(
            payload,
            "<COLLECTION NAME=\"SynCollection\"><TYPE>{root_collection}</TYPE>"
        );
        if !spec.fetch.is_empty() {
            let _ = write!(payload, "<FETCH>{}</FETCH>", spec.fetch.join(","));
        }
        if !spec.filters.is_empty() {
            let filter_names: Vec<String> = (1..=spec.filters.len())
                .map(|index| indexed("Flt", index))
                .collect();
            let _ = write!(payload, "<FILTER>{}</FILTER>", filter_names.join(","));
        }
        payload.push_str("</COLLECTION>");

        for (index, filter) in spec.filters.iter().enumerate() {
            let _ = write!(
                payload,
                "<SYSTEM TYPE=\"Formulae\" NAME=\"{name}\">{filter}</SYSTEM>",
                name = indexed("Flt", index + 1)
            );
        }

        payload.push_str("</TDLMESSAGE></TDL></DESC></BODY></ENVELOPE>");
        payload
    }
}

fn metadata_envelope(report_id: &str, export_format: &str, company: &str, tdl: &str) -> String {
    let sv_company = if company.is_empty() {
        String::new()
    } else {
        format!(
            "<SVCURRENTCOMPANY>{}</SVCURRENTCOMPANY>",
            escape_xml(company)
        )
    };
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><ENVELOPE><HEADER><VERSION>1</VERSION>",
            "<TALLYREQUEST>Export</TALLYREQUEST><TYPE>Data</TYPE><ID>{id}</ID></HEADER>",
            "<BODY><DESC><STATICVARIABLES><SVEXPORTFORMAT>{format}</SVEXPORTFORMAT>{company}</STATICVARIABLES>",
            "<TDL><TDLMESSAGE>{tdl}</TDLMESSAGE></TDL></DESC></BODY></ENVELOPE>",
        ),
        id = report_id,
        format = export_format,
        company = sv_company,
        tdl = tdl
    )
}

/// Report listing every company open on the gateway: name, number, and the
/// bounds of its books, tagged `F01..F04`.
pub fn list_companies_payload() -> String {
    let tdl = concat!(
        "<REPORT NAME=\"SynCompanyList\"><FORMS>SynCompanyList</FORMS></REPORT>",
        "<FORM NAME=\"SynCompanyList\"><PARTS>SynCompanyList</PARTS></FORM>",
        "<PART NAME=\"SynCompanyList\"><LINES>SynCompanyList</LINES>",
        "<REPEAT>SynCompanyList : Company</REPEAT><SCROLLED>Vertical</SCROLLED></PART>",
        "<LINE NAME=\"SynCompanyList\"><FIELDS>FldName,FldNumber,FldBooksFrom,FldBooksTo</FIELDS></LINE>",
        "<FIELD NAME=\"FldName\"><SET>$Name</SET><XMLTAG>F01</XMLTAG></FIELD>",
        "<FIELD NAME=\"FldNumber\"><SET>$CompanyNumber</SET><XMLTAG>F02</XMLTAG></FIELD>",
        "<FIELD NAME=\"FldBooksFrom\"><SET>$$PyrlYYYYMMDD:$BooksFrom</SET><XMLTAG>F03</XMLTAG></FIELD>",
        "<FIELD NAME=\"FldBooksTo\"><SET>$$PyrlYYYYMMDD:$LastVoucherDate</SET><XMLTAG>F04</XMLTAG></FIELD>",
    );
    metadata_envelope("SynCompanyList", "$$SysName:XML", "", tdl)
}

/// Single-row report describing the target (or active) company, including its
/// GUID and current alter-id.
pub fn company_info_payload(company: &str) -> String {
    let tdl = concat!(
        "<REPORT NAME=\"SynCompanyInfo\"><FORMS>SynCompanyInfo</FORMS></REPORT>",
        "<FORM NAME=\"SynCompanyInfo\"><PARTS>SynCompanyInfo</PARTS></FORM>",
        "<PART NAME=\"SynCompanyInfo\"><LINES>SynCompanyInfo</LINES>",
        "<REPEAT>SynCompanyInfo : Company</REPEAT><SCROLLED>Vertical</SCROLLED></PART>",
        "<LINE NAME=\"SynCompanyInfo\"><FIELDS>FldName,FldBooksFrom,FldLastVoucherDate,FldGuid,FldAlterId</FIELDS></LINE>",
        "<FIELD NAME=\"FldName\"><SET>$Name</SET><XMLTAG>F01</XMLTAG></FIELD>",
        "<FIELD NAME=\"FldBooksFrom\"><SET>$$PyrlYYYYMMDD:$BooksFrom</SET><XMLTAG>F02</XMLTAG></FIELD>",
        "<FIELD NAME=\"FldLastVoucherDate\"><SET>$$PyrlYYYYMMDD:$LastVoucherDate</SET><XMLTAG>F03</XMLTAG></FIELD>",
        "<FIELD NAME=\"FldGuid\"><SET>$GUID</SET><XMLTAG>F04</XMLTAG></FIELD>",
        "<FIELD NAME=\"FldAlterId\"><SET>$AlterID</SET><XMLTAG>F05</XMLTAG></FIELD>",
    );
    metadata_envelope("SynCompanyInfo", "$$SysName:XML", company, tdl)
}

/// Comma-delimited report returning the master and transaction alter-ids for
/// the active company; the change-detection key for incremental sync.
pub fn alter_ids_payload(company: &str) -> String {
    let tdl = concat!(
        "<REPORT NAME=\"SynAlterIds\"><FORMS>SynAlterIds</FORMS></REPORT>",
        "<FORM NAME=\"SynAlterIds\"><PARTS>SynAlterIds</PARTS></FORM>",
        "<PART NAME=\"SynAlterIds\"><LINES>SynAlterIds</LINES>",
        "<REPEAT>SynAlterIds : SynActiveCompany</REPEAT><SCROLLED>Vertical</SCROLLED></PART>",
        "<LINE NAME=\"SynAlterIds\"><FIELDS>FldAlterMaster,FldAlterTransaction</FIELDS></LINE>",
        "<FIELD NAME=\"FldAlterMaster\"><SET>$AltMstId</SET></FIELD>",
        "<FIELD NAME=\"FldAlterTransaction\"><SET>$AltVchId</SET></FIELD>",
        "<COLLECTION NAME=\"SynActiveCompany\"><TYPE>Company</TYPE><FILTER>FltActiveCompany</FILTER></COLLECTION>",
        "<SYSTEM TYPE=\"Formulae\" NAME=\"FltActiveCompany\">$$IsEqual:##SVCurrentCompany:$Name</SYSTEM>",
    );
    metadata_envelope("SynAlterIds", "ASCII (Comma Delimited)", company, tdl)
}
