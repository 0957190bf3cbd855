/// Minimal domain hierarchy utilities
pub struct DomainUtils;

const TWO_PART_SUFFIXES: &[&str] = &[
    "co.uk", "com.au", "co.jp", "co.kr", "com.br", "co.za", "com.mx", "co.in", "com.sg",
    "co.nz", "com.ar", "co.il", "org.uk", "net.au", "gov.uk", "ac.uk", "edu.au",
];

impl DomainUtils {
    /// Hostname syntax check: dotted labels of ASCII letters, digits and hyphens.
    pub fn is_valid_domain(domain: &str) -> bool {
        if domain.is_empty() || domain.len() > 253 || !domain.contains('.') {
            return false;
        }

        domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
    }

    /// Check if domain matches any in list (with hierarchy support)
    pub fn matches_domain_list(domain: &str, domain_list: &[String]) -> bool {
        let domain_lower = domain.to_lowercase();

        for pattern in domain_list {
            let pattern_lower = pattern.to_lowercase();

            // Exact match
            if domain_lower == pattern_lower {
                return true;
            }

            // Subdomain match (domain ends with .pattern)
            if domain_lower.ends_with(&format!(".{}", pattern_lower)) {
                return true;
            }
        }

        false
    }

    /// Check if the host ends with one of the given suffixes (`.xyz` style).
    pub fn has_suffix(host: &str, suffixes: &[String]) -> bool {
        let host_lower = host.to_lowercase();
        suffixes
            .iter()
            .any(|suffix| host_lower.ends_with(&suffix.to_lowercase()))
    }

    /// Registrable domain, e.g. "mail.shop.example.co.uk" -> "example.co.uk"
    pub fn organizational_domain(domain: &str) -> String {
        let domain = domain.trim_end_matches('.').to_lowercase();
        let parts: Vec<&str> = domain.split('.').collect();

        if parts.len() < 2 {
            return domain;
        }

        let last_two = format!("{}.{}", parts[parts.len() - 2], parts[parts.len() - 1]);
        if parts.len() >= 3 && TWO_PART_SUFFIXES.contains(&last_two.as_str()) {
            format!("{}.{}", parts[parts.len() - 3], last_two)
        } else {
            last_two
        }
    }
}
