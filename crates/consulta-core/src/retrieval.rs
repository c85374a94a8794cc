//! Relevance selection over the active regulatory corpus.
//!
//! The default strategy is deliberately simple keyword/substring scoring,
//! kept behind [`RelevanceStrategy`] so it can be swapped for a smarter
//! retriever without touching the prompt or generation contracts.

use crate::{Document, DocumentId};

/// Query words this short carry no retrieval signal and are discarded.
const MIN_TERM_CHARS: usize = 4;

/// The context block chosen for one generation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSelection {
    /// Concatenated document text, blank-line separated, capped by the caller.
    pub text: String,
    /// Documents that contributed text, in store order.
    pub referenced_document_ids: Vec<DocumentId>,
    /// True when no document matched and the whole corpus was used instead.
    pub used_fallback: bool,
}

impl ContextSelection {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

pub trait RelevanceStrategy {
    /// Select context for `query` from `documents`, which the caller has
    /// already filtered to `active = true`. `max_context_chars` must be > 0.
    fn select(
        &self,
        query: &str,
        documents: &[Document],
        max_context_chars: usize,
    ) -> ContextSelection;
}

/// Keyword/substring scorer: a document matches when at least one distinct
/// query term of more than three characters occurs in its lowercased text.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordSelector;

impl KeywordSelector {
    /// Distinct lowercase query terms longer than three characters, in
    /// first-occurrence order.
    #[must_use]
    pub fn query_terms(query: &str) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        for word in query.split_whitespace() {
            let term = word.to_lowercase();
            if term.chars().count() < MIN_TERM_CHARS {
                continue;
            }
            if !terms.contains(&term) {
                terms.push(term);
            }
        }
        terms
    }

    fn match_count(terms: &[String], document: &Document) -> usize {
        let haystack = document.text.to_lowercase();
        terms.iter().filter(|term| haystack.contains(term.as_str())).count()
    }
}

impl RelevanceStrategy for KeywordSelector {
    fn select(
        &self,
        query: &str,
        documents: &[Document],
        max_context_chars: usize,
    ) -> ContextSelection {
        if documents.is_empty() {
            // Valid outcome: the composer states that no context is available.
            return ContextSelection {
                text: String::new(),
                referenced_document_ids: Vec::new(),
                used_fallback: false,
            };
        }

        let terms = Self::query_terms(query);

        // A query with zero usable terms goes straight to the fallback branch;
        // trivially matching every document would be meaningless.
        let matched: Vec<&Document> = if terms.is_empty() {
            Vec::new()
        } else {
            documents
                .iter()
                .filter(|document| Self::match_count(&terms, document) > 0)
                .collect()
        };

        // Favor recall when there is no keyword signal at all.
        let (selection, used_fallback) = if matched.is_empty() {
            (documents.iter().collect::<Vec<_>>(), true)
        } else {
            (matched, false)
        };

        let (text, referenced_document_ids) = concat_capped(&selection, max_context_chars);
        ContextSelection { text, referenced_document_ids, used_fallback }
    }
}

/// Concatenate documents in order, blank-line separated, without exceeding
/// `cap` characters. The budget counts chars, not bytes, so multibyte text
/// does not cap early. A document that does not fit is dropped whole when
/// earlier text is already present; only the very first document may be
/// truncated, to the remaining char budget, when it alone exceeds it.
fn concat_capped(documents: &[&Document], cap: usize) -> (String, Vec<DocumentId>) {
    const SEPARATOR: &str = "\n\n";
    const SEPARATOR_CHARS: usize = 2;

    let mut text = String::new();
    let mut used_chars = 0;
    let mut ids = Vec::new();

    for document in documents {
        let separator_chars = if text.is_empty() { 0 } else { SEPARATOR_CHARS };
        let remaining = cap.saturating_sub(used_chars + separator_chars);
        let document_chars = document.text.chars().count();

        if document_chars <= remaining {
            if !text.is_empty() {
                text.push_str(SEPARATOR);
                used_chars += SEPARATOR_CHARS;
            }
            text.push_str(&document.text);
            used_chars += document_chars;
            ids.push(document.id);
            continue;
        }

        if text.is_empty() && remaining > 0 {
            text.extend(document.text.chars().take(remaining));
            ids.push(document.id);
        }

        // Budget reached; later documents are dropped whole.
        break;
    }

    (text, ids)
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::DocumentKind;

    fn document(text: &str) -> Document {
        let now = OffsetDateTime::now_utc();
        Document {
            id: DocumentId::new(),
            title: "Documento".to_string(),
            text: text.to_string(),
            kind: DocumentKind::Ley,
            number: None,
            category_id: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn query_terms_discards_short_words_and_duplicates() {
        let terms = KeywordSelector::query_terms("La Ley de contrataciones y la LEY vigente");
        assert_eq!(terms, vec!["contrataciones", "vigente"]);
    }

    #[test]
    fn selects_only_documents_containing_query_terms() {
        let ley = document(
            "Ley de Contrataciones: los requisitos para una licitación pública se fijan aquí.",
        );
        let reglamento = document("Reglamento general de procedimientos administrativos.");
        let documents = vec![ley.clone(), reglamento.clone()];

        let selection = KeywordSelector.select("requisitos licitación", &documents, 10_000);

        assert!(!selection.used_fallback);
        assert!(selection.text.contains("Ley de Contrataciones"));
        assert!(!selection.text.contains("Reglamento general"));
        assert_eq!(selection.referenced_document_ids, vec![ley.id]);
    }

    #[test]
    fn matched_documents_keep_store_order_with_blank_line_separator() {
        let first = document("Primera norma sobre licitación.");
        let second = document("Segunda norma sobre licitación.");
        let documents = vec![first.clone(), second.clone()];

        let selection = KeywordSelector.select("licitación", &documents, 10_000);

        assert_eq!(
            selection.text,
            format!("{}\n\n{}", first.text, second.text)
        );
        assert_eq!(selection.referenced_document_ids, vec![first.id, second.id]);
    }

    #[test]
    fn falls_back_to_full_corpus_when_nothing_matches() {
        let documents = vec![document("Norma uno."), document("Norma dos.")];

        let selection = KeywordSelector.select("inexistente", &documents, 10_000);

        assert!(selection.used_fallback);
        assert!(selection.text.contains("Norma uno."));
        assert!(selection.text.contains("Norma dos."));
    }

    #[test]
    fn zero_usable_terms_uses_the_fallback_branch_not_trivial_matches() {
        let documents = vec![document("Norma uno."), document("Norma dos.")];

        // Every word is three characters or fewer.
        let selection = KeywordSelector.select("la de ley ok", &documents, 10_000);

        assert!(selection.used_fallback);
        assert_eq!(selection.referenced_document_ids.len(), 2);
        assert!(!selection.text.is_empty());
    }

    #[test]
    fn empty_corpus_yields_an_empty_non_fallback_selection() {
        let selection = KeywordSelector.select("licitación", &[], 10_000);
        assert!(selection.is_empty());
        assert!(!selection.used_fallback);
        assert!(selection.referenced_document_ids.is_empty());
    }

    #[test]
    fn documents_that_do_not_fit_are_dropped_whole() {
        let first = document("Texto corto sobre licitación.");
        let second = document(&"licitación ".repeat(50));
        let documents = vec![first.clone(), second];

        let cap = first.text.chars().count() + 10;
        let selection = KeywordSelector.select("licitación", &documents, cap);

        assert_eq!(selection.text, first.text);
        assert_eq!(selection.referenced_document_ids, vec![first.id]);
    }

    #[test]
    fn a_lone_oversized_document_is_truncated_to_the_char_budget() {
        let long = document(&"licitación pública ".repeat(100));
        let documents = vec![long.clone()];

        let selection = KeywordSelector.select("licitación", &documents, 37);

        assert_eq!(selection.text.chars().count(), 37);
        assert!(long.text.starts_with(&selection.text));
        assert_eq!(selection.referenced_document_ids, vec![long.id]);
    }

    #[test]
    fn the_budget_counts_characters_not_bytes() {
        // More bytes than chars; a byte-counted cap would truncate it.
        let accented = document("Resolución única de selección");
        assert!(accented.text.len() > accented.text.chars().count());
        let documents = vec![accented.clone()];

        let cap = accented.text.chars().count();
        let selection = KeywordSelector.select("selección", &documents, cap);

        assert_eq!(selection.text, accented.text);
        assert_eq!(selection.referenced_document_ids, vec![accented.id]);
    }
}
