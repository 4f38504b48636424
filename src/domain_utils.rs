/// Minimal domain and mailbox utilities
pub struct DomainUtils;

impl DomainUtils {
    /// Split an envelope sender into local-part and domain.
    ///
    /// Missing pieces fall back to `postmaster` and the HELO name. The domain
    /// keeps its case; only the root dot is removed.
    pub fn split_sender(sender: &str, helo_domain: &str) -> (String, String) {
        let sender = sender.trim().trim_start_matches('<').trim_end_matches('>');

        if sender.is_empty() {
            return ("postmaster".to_string(), Self::strip_root(helo_domain));
        }

        match sender.rsplit_once('@') {
            Some((local, domain)) => {
                let local = if local.is_empty() { "postmaster" } else { local };
                (local.to_string(), Self::strip_root(domain))
            }
            None => ("postmaster".to_string(), Self::strip_root(sender)),
        }
    }

    fn strip_root(domain: &str) -> String {
        domain.trim().trim_end_matches('.').to_string()
    }

    /// Lowercase and strip the root dot
    pub fn normalize(domain: &str) -> String {
        Self::strip_root(domain).to_lowercase()
    }

    /// Check if domain1 is domain2 or one of its subdomains
    pub fn is_subdomain_of(domain1: &str, domain2: &str) -> bool {
        let domain1 = Self::normalize(domain1);
        let domain2 = Self::normalize(domain2);

        domain1 == domain2 || domain1.ends_with(&format!(".{}", domain2))
    }
}
