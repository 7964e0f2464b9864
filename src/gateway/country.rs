//! Country normalization for the provider's address schema.
//!
//! The provider only accepts ISO-3166-1 alpha-2 codes. Carts carry whatever
//! the user typed, so non-conforming names and codes are mapped through a
//! fixed lookup table, defaulting to `US` when nothing matches.

/// Normalizes a country name or code to ISO-3166-1 alpha-2.
pub fn to_alpha2(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return trimmed.to_ascii_uppercase();
    }

    let code = match trimmed.to_ascii_uppercase().as_str() {
        "USA" | "UNITED STATES" | "UNITED STATES OF AMERICA" => "US",
        "UNITED KINGDOM" | "GREAT BRITAIN" | "ENGLAND" => "GB",
        "CANADA" => "CA",
        "AUSTRALIA" => "AU",
        "GERMANY" | "DEUTSCHLAND" => "DE",
        "FRANCE" => "FR",
        "SPAIN" => "ES",
        "ITALY" => "IT",
        "NETHERLANDS" | "THE NETHERLANDS" | "HOLLAND" => "NL",
        "BELGIUM" => "BE",
        "SWEDEN" => "SE",
        "NORWAY" => "NO",
        "DENMARK" => "DK",
        "IRELAND" => "IE",
        "SWITZERLAND" => "CH",
        "AUSTRIA" => "AT",
        "POLAND" => "PL",
        "PORTUGAL" => "PT",
        "JAPAN" => "JP",
        "CHINA" => "CN",
        "INDIA" => "IN",
        "BRAZIL" => "BR",
        "MEXICO" => "MX",
        "NEW ZEALAND" => "NZ",
        "SOUTH KOREA" | "KOREA" => "KR",
        "SINGAPORE" => "SG",
        _ => "US",
    };
    code.to_string()
}
