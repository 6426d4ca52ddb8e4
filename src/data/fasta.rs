//! FASTA header utilities.
//!
//! Feature tables occasionally leave the gene-name column empty while the
//! FASTA headers still carry a UniProt-style `GN=` tag. The extractor pulls
//! the first such tag so downstream tables keep a usable gene label.

use regex::Regex;

/// Extracts `GN=` gene names from semicolon-separated FASTA header lists.
pub(crate) struct GeneExtractor {
    re: Regex,
}

impl GeneExtractor {
    pub(crate) fn new() -> Self {
        // fixed pattern, compilation cannot fail
        let re = Regex::new(r"GN=([^ ;]+)").unwrap();
        Self { re }
    }

    /// First gene name tagged in the headers, if any.
    pub(crate) fn extract(&self, fasta_headers: &str) -> Option<String> {
        self.re
            .captures(fasta_headers)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_first_gene() {
        let ex = GeneExtractor::new();
        let headers = ">sp|P12345|ALBU_HUMAN Serum albumin OS=Homo sapiens GN=ALB PE=1;\
                       >sp|P67890|OTHER_HUMAN Other OS=Homo sapiens GN=OTH PE=1";
        assert_eq!(ex.extract(headers), Some("ALB".to_string()));
    }

    #[test]
    fn test_no_gene_tag() {
        let ex = GeneExtractor::new();
        assert_eq!(ex.extract(">sp|P12345|ALBU_HUMAN Serum albumin"), None);
        assert_eq!(ex.extract(""), None);
    }

    #[test]
    fn test_gene_stops_at_space_or_semicolon() {
        let ex = GeneExtractor::new();
        assert_eq!(ex.extract("GN=MAPK1 PE=1"), Some("MAPK1".to_string()));
        assert_eq!(ex.extract("GN=MAPK1;GN=MAPK3"), Some("MAPK1".to_string()));
    }
}
