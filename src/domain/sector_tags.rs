//! Static symbol → sector tag lookup, enriching a metrics snapshot with
//! human-readable category labels (e.g. "L1", "Meme", "Top 50").
//!
//! Unknown symbols simply have no tags; this is cosmetic enrichment, not a
//! universe filter.

/// Returns the sector tags for `symbol`, or an empty slice if untagged.
pub fn sector_tags(symbol: &str) -> &'static [&'static str] {
    for &(sym, tags) in TAGS {
        if sym == symbol {
            return tags;
        }
    }
    &[]
}

const TAGS: &[(&str, &[&str])] = &[
    ("BTCUSDT", &["Layer 1", "Top 10"]),
    ("ETHUSDT", &["L1", "Smart Contract", "Top 10"]),
    ("SOLUSDT", &["L1", "Smart Contract", "Top 10"]),
    ("AVAXUSDT", &["L1", "Smart Contract", "Top 20"]),
    ("ADAUSDT", &["L1", "Smart Contract", "Top 20"]),
    ("DOTUSDT", &["L1", "Interoperability", "Top 20"]),
    ("ATOMUSDT", &["L1", "Interoperability", "Top 30"]),
    ("NEARUSDT", &["L1", "Smart Contract", "Top 30"]),
    ("APTUSDT", &["L1", "Smart Contract", "Top 30"]),
    ("SUIUSDT", &["L1", "Smart Contract", "Top 50"]),
    ("SEIUSDT", &["L1", "Smart Contract", "Top 100"]),
    ("INJUSDT", &["L1", "DeFi", "Top 50"]),
    ("TONUSDT", &["L1", "Messaging", "Top 20"]),
    ("MATICUSDT", &["L2", "Ethereum", "Top 20"]),
    ("ARBUSDT", &["L2", "Ethereum", "Top 50"]),
    ("OPUSDT", &["L2", "Ethereum", "Top 50"]),
    ("STXUSDT", &["L2", "Bitcoin", "Top 50"]),
    ("LINKUSDT", &["DeFi", "Oracle", "Top 20"]),
    ("UNIUSDT", &["DeFi", "DEX", "Top 30"]),
    ("AAVEUSDT", &["DeFi", "Lending", "Top 50"]),
    ("MKRUSDT", &["DeFi", "Stablecoin", "Top 50"]),
    ("CRVUSDT", &["DeFi", "DEX", "Top 100"]),
    ("COMPUSDT", &["DeFi", "Lending", "Top 100"]),
    ("SNXUSDT", &["DeFi", "Derivatives", "Top 100"]),
    ("LDOUSDT", &["DeFi", "Staking", "Top 50"]),
    ("RNDRUSDT", &["DeFi", "AI", "Top 50"]),
    ("1INCHUSDT", &["DeFi", "DEX", "Top 100"]),
    ("GMXUSDT", &["DeFi", "Derivatives", "Top 100"]),
    ("DYDXUSDT", &["DeFi", "Derivatives", "Top 100"]),
    ("DOGEUSDT", &["Meme", "Top 10"]),
    ("SHIBUSDT", &["Meme", "Top 20"]),
    ("PEPEUSDT", &["Meme", "Top 50"]),
    ("FLOKIUSDT", &["Meme", "Top 100"]),
    ("BONKUSDT", &["Meme", "Solana", "Top 100"]),
    ("WIFUSDT", &["Meme", "Solana", "Top 100"]),
    ("FETUSDT", &["AI", "Top 50"]),
    ("AGIXUSDT", &["AI", "Top 100"]),
    ("OCEANUSDT", &["AI", "Data", "Top 100"]),
    ("TAOUSDT", &["AI", "Top 100"]),
    ("AKTUSDT", &["AI", "Compute", "Top 100"]),
    ("AXSUSDT", &["Gaming", "Top 100"]),
    ("SANDUSDT", &["Metaverse", "Top 100"]),
    ("MANAUSDT", &["Metaverse", "Top 100"]),
    ("ENJUSDT", &["Gaming", "NFT", "Top 100"]),
    ("GALAUSDT", &["Gaming", "Top 100"]),
    ("IMXUSDT", &["Gaming", "L2", "Top 50"]),
    ("FILUSDT", &["Storage", "Top 50"]),
    ("ARUSDT", &["Storage", "Top 100"]),
    ("ICPUSDT", &["Compute", "Top 30"]),
    ("GRTUSDT", &["Indexing", "Top 50"]),
    ("QNTUSDT", &["Interoperability", "Enterprise", "Top 50"]),
    ("BNBUSDT", &["Exchange", "Binance", "Top 10"]),
    ("XMRUSDT", &["Privacy", "Top 50"]),
    ("ZECUSDT", &["Privacy", "Top 100"]),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_symbol_returns_tags() {
        assert_eq!(sector_tags("DOGEUSDT"), &["Meme", "Top 10"]);
    }

    #[test]
    fn unknown_symbol_returns_empty() {
        assert!(sector_tags("NOPEUSDT").is_empty());
    }
}
