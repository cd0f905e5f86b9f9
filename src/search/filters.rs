/// Filters that can be applied to search/list queries.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    /// Decimal prefix: `50.01` matches `50.01` and everything below it.
    pub decimal: Option<String>,
    pub tag: Option<String>,
    pub source_kind: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

impl Filters {
    /// Build WHERE clause fragments and params for transcript-level queries.
    /// Placeholders are numbered from `first_param`.
    pub fn transcript_conditions(
        &self,
        first_param: usize,
    ) -> (Vec<String>, Vec<Box<dyn rusqlite::types::ToSql>>) {
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let next = |params: &Vec<Box<dyn rusqlite::types::ToSql>>| first_param + params.len();

        if let Some(ref decimal) = self.decimal {
            let n = next(&params);
            conditions.push(format!("(t.decimal = ?{n} OR t.decimal LIKE ?{} ESCAPE '\\')", n + 1));
            params.push(Box::new(decimal.clone()));
            params.push(Box::new(format!("{}.%", escape_like(decimal))));
        }

        if let Some(ref tag) = self.tag {
            conditions.push(format!("t.tags LIKE ?{} ESCAPE '\\'", next(&params)));
            params.push(Box::new(format!("%,{},%", escape_like(tag))));
        }

        if let Some(ref kind) = self.source_kind {
            conditions.push(format!("t.source_kind = ?{}", next(&params)));
            params.push(Box::new(kind.clone()));
        }

        if let Some(ref from) = self.from_date {
            conditions.push(format!("t.date >= ?{}", next(&params)));
            params.push(Box::new(from.clone()));
        }

        if let Some(ref to) = self.to_date {
            // Dates are RFC 3339 strings; make a bare YYYY-MM-DD bound inclusive.
            let bound = if to.len() == 10 {
                format!("{to}T99")
            } else {
                to.clone()
            };
            conditions.push(format!("t.date <= ?{}", next(&params)));
            params.push(Box::new(bound));
        }

        (conditions, params)
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
