use chrono::{NaiveDate, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::fingerprint::fingerprint;

/// Canonical columns a raw CSV header can map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Col {
    Date,
    Time,
    Product,
    OrderId,
    ProductId,
    Platform,
    Category,
    Status,
    SubId,
    Revenue,
    Cost,
    Commission,
    Quantity,
    Channel,
    Clicks,
}

/// Ordered synonym table; the first synonym that matches a header wins, and
/// earlier entries shadow later ones (so a file carrying both a revenue and a
/// gross-value column maps the revenue one). Names are matched after
/// `normalize_header`, which covers the accented Portuguese spellings the
/// affiliate platforms export.
const SYNONYMS: &[(Col, &[&str])] = &[
    (
        Col::Date,
        &["date", "data", "data_do_pedido", "transaction_date", "horario_do_pedido"],
    ),
    (Col::Time, &["time", "hora", "hora_do_pedido"]),
    (
        Col::Product,
        &["product", "produto", "product_name", "produto_nome", "nome_do_item"],
    ),
    (
        Col::OrderId,
        &["order_id", "id_do_pedido", "numero_do_pedido", "id_pagamento"],
    ),
    (
        Col::ProductId,
        &["product_id", "id_do_item", "item_id", "id_do_produto"],
    ),
    (
        Col::Platform,
        &["platform", "plataforma", "origem_do_pedido", "origem"],
    ),
    (Col::Category, &["category", "categoria", "categoria_global"]),
    (Col::Status, &["status", "status_do_pedido"]),
    (Col::SubId, &["sub_id", "subid", "sub_id1", "subid1", "referencia"]),
    (
        Col::Revenue,
        &[
            "revenue",
            "receita",
            "valor_bruto",
            "gross_value",
            "valor_de_compra",
            "valor_de_compra_r",
            "valor_venda",
            "faturamento",
            "preco",
            "preco_r",
        ],
    ),
    (
        Col::Cost,
        &["cost", "custo", "custo_total", "valor_gasto", "gasto_anuncios"],
    ),
    (
        Col::Commission,
        &[
            "commission",
            "comissao",
            "comissao_liquida",
            "comissao_liquida_r",
            "comissao_liquida_do_afiliado",
            "comissao_liquida_do_afiliado_r",
            "comissao_total_do_pedido",
            "comissao_total_do_pedido_r",
            "taxa",
            "fee",
        ],
    ),
    (
        Col::Quantity,
        &["quantity", "quantidade", "qtd", "item_count", "sales_count"],
    ),
    (
        Col::Channel,
        &["channel", "canal", "origem", "referenciador", "referrer", "plataforma"],
    ),
    (
        Col::Clicks,
        &["clicks", "cliques", "total_de_cliques", "quantidade_cliques"],
    ),
];

/// Lowercase, trim, fold accents to ASCII and collapse every run of
/// non-alphanumerics into a single underscore.
pub fn normalize_header(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = true;
    for ch in name.trim().chars() {
        let ch = fold_accent(ch).to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

// Covers the accented characters the affiliate exports actually contain.
fn fold_accent(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'u',
        'ç' | 'Ç' => 'c',
        'ñ' | 'Ñ' => 'n',
        other => other,
    }
}

/// Where each canonical column lives in this file's header, if anywhere.
#[derive(Debug, Default, Clone)]
pub struct ColumnMap {
    slots: std::collections::HashMap<Col, usize>,
}

impl ColumnMap {
    pub fn detect(headers: &[String]) -> Self {
        let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
        let mut slots = std::collections::HashMap::new();
        for (col, synonyms) in SYNONYMS {
            if slots.contains_key(col) {
                continue;
            }
            'syn: for syn in *synonyms {
                for (idx, header) in normalized.iter().enumerate() {
                    if header == syn {
                        slots.insert(*col, idx);
                        break 'syn;
                    }
                }
            }
        }
        Self { slots }
    }

    pub fn get<'a>(&self, col: Col, record: &'a csv::StringRecord) -> Option<&'a str> {
        self.slots
            .get(&col)
            .and_then(|&idx| record.get(idx))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn has(&self, col: Col) -> bool {
        self.slots.contains_key(&col)
    }
}

/// Separator sniffing over the header line: whichever of `,` `;` `\t`
/// occurs most wins, comma on ties.
pub fn sniff_delimiter(header_line: &str) -> u8 {
    let commas = header_line.matches(',').count();
    let semis = header_line.matches(';').count();
    let tabs = header_line.matches('\t').count();
    if tabs > commas && tabs > semis {
        b'\t'
    } else if semis > commas {
        b';'
    } else {
        b','
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Transaction,
    Click,
}

impl RowKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transaction" => Some(RowKind::Transaction),
            "click" => Some(RowKind::Click),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTransaction {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub platform: Option<String>,
    pub category: Option<String>,
    pub product: String,
    pub status: Option<String>,
    pub sub_id: Option<String>,
    pub order_id: Option<String>,
    pub product_id: Option<String>,
    pub revenue: Decimal,
    pub commission: Decimal,
    pub cost: Decimal,
    pub profit: Decimal,
    pub quantity: i32,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedClick {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub channel: String,
    pub sub_id: Option<String>,
    pub clicks: i32,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedRow {
    Transaction(NormalizedTransaction),
    Click(NormalizedClick),
}

/// Header-level validation: without these columns no row of the file can be
/// normalized, which is a schema mismatch rather than a row rejection.
pub fn check_schema(kind: RowKind, map: &ColumnMap) -> Result<(), String> {
    match kind {
        RowKind::Transaction => {
            if !map.has(Col::Date) {
                return Err("no date column recognized in header".into());
            }
            if !map.has(Col::Product) {
                return Err("no product column recognized in header".into());
            }
        }
        RowKind::Click => {
            if !map.has(Col::Date) {
                return Err("no date column recognized in header".into());
            }
        }
    }
    Ok(())
}

pub fn normalize_row(
    kind: RowKind,
    map: &ColumnMap,
    record: &csv::StringRecord,
    owner_id: i64,
) -> Result<NormalizedRow, String> {
    match kind {
        RowKind::Transaction => normalize_transaction(map, record, owner_id).map(NormalizedRow::Transaction),
        RowKind::Click => normalize_click(map, record, owner_id).map(NormalizedRow::Click),
    }
}

fn normalize_transaction(
    map: &ColumnMap,
    record: &csv::StringRecord,
    owner_id: i64,
) -> Result<NormalizedTransaction, String> {
    let raw_date = map
        .get(Col::Date, record)
        .ok_or_else(|| "missing date".to_string())?;
    let (date, embedded_time) =
        parse_date(raw_date).ok_or_else(|| format!("unparseable date '{}'", raw_date))?;
    let time = match map.get(Col::Time, record) {
        Some(raw) => parse_time(raw),
        None => embedded_time,
    };

    let product = map
        .get(Col::Product, record)
        .ok_or_else(|| "missing product".to_string())?
        .to_string();

    let platform = map.get(Col::Platform, record).map(str::to_string);
    let category = map.get(Col::Category, record).map(str::to_string);
    let status = map.get(Col::Status, record).map(str::to_string);
    let sub_id = map.get(Col::SubId, record).map(str::to_string);
    let order_id = map.get(Col::OrderId, record).map(str::to_string);
    let product_id = map.get(Col::ProductId, record).map(str::to_string);

    let revenue = money(map.get(Col::Revenue, record));
    let cost = money(map.get(Col::Cost, record));
    let commission = money(map.get(Col::Commission, record));
    let quantity = map
        .get(Col::Quantity, record)
        .and_then(parse_decimal)
        .and_then(|d| d.trunc().to_i32())
        .map(|q| q.max(0))
        .unwrap_or(1);

    let profit = revenue - cost - commission;

    let date_str = date.to_string();
    let fp = fingerprint(
        owner_id,
        &[
            Some(date_str.as_str()),
            platform.as_deref(),
            category.as_deref(),
            Some(product.as_str()),
            status.as_deref(),
            sub_id.as_deref(),
            order_id.as_deref(),
            product_id.as_deref(),
        ],
    );

    Ok(NormalizedTransaction {
        date,
        time,
        platform,
        category,
        product,
        status,
        sub_id,
        order_id,
        product_id,
        revenue,
        commission,
        cost,
        profit,
        quantity,
        fingerprint: fp,
    })
}

fn normalize_click(
    map: &ColumnMap,
    record: &csv::StringRecord,
    owner_id: i64,
) -> Result<NormalizedClick, String> {
    let raw_date = map
        .get(Col::Date, record)
        .ok_or_else(|| "missing date".to_string())?;
    let (date, embedded_time) =
        parse_date(raw_date).ok_or_else(|| format!("unparseable date '{}'", raw_date))?;
    let time = match map.get(Col::Time, record) {
        Some(raw) => parse_time(raw),
        None => embedded_time,
    };

    let channel = map
        .get(Col::Channel, record)
        .unwrap_or("unknown")
        .to_string();
    let sub_id = map.get(Col::SubId, record).map(str::to_string);

    // Without a clicks column each line is a single click event.
    let clicks = map
        .get(Col::Clicks, record)
        .and_then(parse_decimal)
        .and_then(|d| d.trunc().to_i32())
        .map(|c| c.max(0))
        .unwrap_or(1);

    let date_str = date.to_string();
    let fp = fingerprint(
        owner_id,
        &[Some(date_str.as_str()), Some(channel.as_str()), sub_id.as_deref()],
    );

    Ok(NormalizedClick {
        date,
        time,
        channel,
        sub_id,
        clicks,
        fingerprint: fp,
    })
}

fn money(raw: Option<&str>) -> Decimal {
    raw.and_then(parse_decimal)
        .map(|d| d.max(Decimal::ZERO))
        .unwrap_or(Decimal::ZERO)
}

/// Locale-flexible money parsing. Currency markers and whitespace are
/// stripped; `.` and `,` are disambiguated by the rightmost separator (it is
/// the decimal point, the other is thousands), and a repeated separator is
/// always thousands.
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let commas = cleaned.matches(',').count();
    let dots = cleaned.matches('.').count();

    let canonical = if commas > 0 && dots > 0 {
        let last_comma = cleaned.rfind(',').unwrap();
        let last_dot = cleaned.rfind('.').unwrap();
        if last_comma > last_dot {
            // 1.234,56
            cleaned.replace('.', "").replace(',', ".")
        } else {
            // 1,234.56
            cleaned.replace(',', "")
        }
    } else if commas > 1 {
        cleaned.replace(',', "")
    } else if commas == 1 {
        cleaned.replace(',', ".")
    } else if dots > 1 {
        cleaned.replace('.', "")
    } else {
        cleaned
    };

    canonical.parse().ok()
}

/// ISO `YYYY-MM-DD`, `DD/MM/YYYY`, or either with a trailing time component
/// (extracted separately).
pub fn parse_date(raw: &str) -> Option<(NaiveDate, Option<NaiveTime>)> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some((dt.date(), Some(dt.time())));
        }
    }

    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some((d, None));
        }
    }
    None
}

pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}
