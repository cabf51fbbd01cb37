pub mod normalized_symbols {
    use keel_core::normalize_symbol;
    use serde::de::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let symbols = Vec::<String>::deserialize(deserializer)?;
        let mut normalized: Vec<String> = Vec::with_capacity(symbols.len());
        for symbol in symbols.iter().map(|raw| normalize_symbol(raw)) {
            if !symbol.is_empty() && !normalized.contains(&symbol) {
                normalized.push(symbol);
            }
        }
        Ok(normalized)
    }
}
