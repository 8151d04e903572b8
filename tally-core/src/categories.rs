//! Built-in keyword table mapping merchant vocabulary to default categories.
//!
//! Checked after user rules. Table order matters: the first category with a
//! matching keyword wins, so more specific vocabulary sits higher.

use serde::{Deserialize, Serialize};

/// Closed set of categories the built-in table can produce
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DefaultCategory {
    Groceries,
    Dining,
    Transport,
    Housing,
    Utilities,
    Subscriptions,
    Shopping,
    Health,
    Entertainment,
    Travel,
    Income,
    Transfers,
    Fees,
}

impl DefaultCategory {
    pub const ALL: [DefaultCategory; 13] = [
        DefaultCategory::Groceries,
        DefaultCategory::Dining,
        DefaultCategory::Transport,
        DefaultCategory::Housing,
        DefaultCategory::Utilities,
        DefaultCategory::Subscriptions,
        DefaultCategory::Shopping,
        DefaultCategory::Health,
        DefaultCategory::Entertainment,
        DefaultCategory::Travel,
        DefaultCategory::Income,
        DefaultCategory::Transfers,
        DefaultCategory::Fees,
    ];

    /// Display name stored on transactions
    pub fn as_str(&self) -> &'static str {
        match self {
            DefaultCategory::Groceries => "Groceries",
            DefaultCategory::Dining => "Dining",
            DefaultCategory::Transport => "Transport",
            DefaultCategory::Housing => "Housing",
            DefaultCategory::Utilities => "Utilities",
            DefaultCategory::Subscriptions => "Subscriptions",
            DefaultCategory::Shopping => "Shopping",
            DefaultCategory::Health => "Health",
            DefaultCategory::Entertainment => "Entertainment",
            DefaultCategory::Travel => "Travel",
            DefaultCategory::Income => "Income",
            DefaultCategory::Transfers => "Transfers",
            DefaultCategory::Fees => "Fees",
        }
    }
}

// Keywords are uppercase; descriptions are uppercased before matching.
const DEFAULT_TABLE: &[(DefaultCategory, &[&str])] = &[
    // Food delivery before transport so "UBER EATS" is not a ride
    (
        DefaultCategory::Dining,
        &[
            "UBER EATS", "WOLT", "JUST EAT", "DELIVEROO", "FOODORA", "MCDONALD",
            "BURGER KING", "STARBUCKS", "SUNSET BOULEVARD", "JOE & THE JUICE",
            "ESPRESSO HOUSE", "RESTAURANT", "CAFE", "PIZZA", "SUSHI", "BAKERY",
        ],
    ),
    (
        DefaultCategory::Groceries,
        &[
            "NETTO", "REMA 1000", "FOETEX", "FØTEX", "BILKA", "LIDL", "ALDI", "IRMA",
            "COOP", "MENY", "SUPERBRUGSEN", "KVICKLY", "DAGLI'BRUGSEN", "LOEVBJERG",
            "LØVBJERG", "SPAR ", "ICA ", "TESCO", "SAINSBURY", "CARREFOUR", "EDEKA",
            "REWE", "ALBERT HEIJN", "WHOLE FOODS", "TRADER JOE",
        ],
    ),
    (
        DefaultCategory::Subscriptions,
        &[
            "NETFLIX", "SPOTIFY", "HBO MAX", "DISNEY PLUS", "DISNEY+", "VIAPLAY",
            "YOUTUBE", "APPLE.COM/BILL", "ICLOUD", "GOOGLE *", "MICROSOFT",
            "ADOBE", "GITHUB", "OPENAI", "DROPBOX", "AUDIBLE", "PATREON",
        ],
    ),
    (
        DefaultCategory::Transport,
        &[
            "UBER", "BOLT.EU", "LYFT", "DSB", "REJSEKORT", "MOVIA", "METRO",
            "CIRCLE K", "SHELL", "Q8", "OK BENZIN", "INGO", "PARKERING", "PARKING",
            "EASYPARK", "BROBIZZ", "TAXI",
        ],
    ),
    (
        DefaultCategory::Travel,
        &[
            "SAS ", "NORWEGIAN AIR", "RYANAIR", "EASYJET", "LUFTHANSA", "AIRBNB",
            "BOOKING.COM", "HOTELS.COM", "EXPEDIA", "HOTEL", "AIRLINE",
        ],
    ),
    (
        DefaultCategory::Housing,
        &["HUSLEJE", "BOLIGFORENING", "LANDLORD", "APARTMENT", "MORTGAGE", "REALKREDIT", "LEASE"],
    ),
    (
        DefaultCategory::Utilities,
        &[
            "ØRSTED", "ORSTED", "ANDEL ENERGI", "NORLYS", "HOFOR", "TELIA", "TELENOR",
            "YOUSEE", "3 MOBIL", "CBB", "ELECTRICITY", "WATER SUPPLY", "BROADBAND",
        ],
    ),
    (
        DefaultCategory::Health,
        &["APOTEK", "PHARMACY", "MATAS", "TANDLÆGE", "TANDLAEGE", "DENTIST", "LÆGE", "CLINIC", "FITNESS", "SATS"],
    ),
    (
        DefaultCategory::Entertainment,
        &["CINEMA", "BIOGRAF", "NORDISK FILM", "TIVOLI", "TICKETMASTER", "STEAM", "PLAYSTATION", "XBOX"],
    ),
    (
        DefaultCategory::Shopping,
        &[
            "AMAZON", "ZALANDO", "H&M", "IKEA", "JYSK", "ELGIGANTEN", "POWER ",
            "MAGASIN", "ILLUM", "NORMAL", "SØSTRENE GRENE", "FLYING TIGER", "ZARA",
        ],
    ),
    (
        DefaultCategory::Income,
        &["SALARY", "PAYROLL", "LØN", "LOEN", "PENSION", "REFUND", "TILBAGEBETALING", "SKAT REFUSION"],
    ),
    (
        DefaultCategory::Transfers,
        &["MOBILEPAY", "VIPPS", "SWISH", "REVOLUT", "WISE.COM", "OVERFØRSEL", "OVERFOERSEL", "TRANSFER"],
    ),
    (
        DefaultCategory::Fees,
        &["GEBYR", "FEE", "RENTER", "INTEREST CHARGE", "OVERTRÆK", "ATM"],
    ),
];

/// Keyword-based detection over the built-in table.
/// Returns `None` when no keyword appears in `text`.
pub fn detect(text: &str) -> Option<DefaultCategory> {
    let haystack = text.to_uppercase();
    DEFAULT_TABLE
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| haystack.contains(kw)))
        .map(|(category, _)| *category)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netto_is_groceries() {
        assert_eq!(detect("NETTO BUTIK 1234 Copenhagen"), Some(DefaultCategory::Groceries));
    }

    #[test]
    fn test_uber_eats_is_dining_not_transport() {
        assert_eq!(detect("UBER EATS 8812"), Some(DefaultCategory::Dining));
        assert_eq!(detect("Uber *Trip"), Some(DefaultCategory::Transport));
    }

    #[test]
    fn test_lowercase_descriptions_match() {
        assert_eq!(detect("spotify p1a2b3"), Some(DefaultCategory::Subscriptions));
        assert_eq!(detect("Rejsekort automatic top-up"), Some(DefaultCategory::Transport));
    }

    #[test]
    fn test_unknown_vendor_is_none() {
        assert_eq!(detect("RANDOM VENDOR XYZ"), None);
        assert_eq!(detect(""), None);
    }

    #[test]
    fn test_every_category_reachable() {
        for category in DefaultCategory::ALL {
            assert!(
                DEFAULT_TABLE.iter().any(|(c, kws)| *c == category && !kws.is_empty()),
                "no keywords for {category:?}"
            );
        }
    }
}
