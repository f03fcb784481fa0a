//! Brazilian phone numbers as the WhatsApp gateways expect them: digits only,
//! country code `55`, two-digit area code, 8 or 9 digit subscriber number.

const COUNTRY_CODE: &str = "55";

pub fn normalize_whatsapp(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = digits.trim_start_matches('0');

    let national = match digits.len() {
        10 | 11 => digits,
        12 | 13 if digits.starts_with(COUNTRY_CODE) => &digits[COUNTRY_CODE.len()..],
        _ => return None,
    };

    // No area code starts or ends with a zero.
    let area = &national[..2];
    if area.starts_with('0') || area.ends_with('0') {
        return None;
    }

    Some(format!("{}{}", COUNTRY_CODE, national))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_local_numbers_with_country_code() {
        assert_eq!(normalize_whatsapp("(11) 98765-4321").as_deref(), Some("5511987654321"));
        assert_eq!(normalize_whatsapp("21 3456-7890").as_deref(), Some("552134567890"));
    }

    #[test]
    fn keeps_numbers_that_already_have_country_code() {
        assert_eq!(normalize_whatsapp("+55 31 99999-0000").as_deref(), Some("5531999990000"));
    }

    #[test]
    fn strips_trunk_prefix() {
        assert_eq!(normalize_whatsapp("0 11 98765 4321").as_deref(), Some("5511987654321"));
    }

    #[test]
    fn rejects_short_or_foreign_numbers() {
        assert_eq!(normalize_whatsapp("98765-4321"), None);
        assert_eq!(normalize_whatsapp("+1 415 555 0100 12"), None);
        assert_eq!(normalize_whatsapp("10 98765-4321"), None);
        assert_eq!(normalize_whatsapp(""), None);
    }
}
