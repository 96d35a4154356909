//! Search-as-you-type debounce.
//!
//! Every search issued for a field takes the next sequence number. A result is
//! applied to the visible state only if no newer search has been issued for
//! that field since, so a slow early response can never overwrite a later one.

use crate::adapter::SearchHit;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTicket {
    pub field: String,
    pub term: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibleResults {
    pub term: String,
    pub seq: u64,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Default)]
struct FieldState {
    issued_seq: u64,
    issued_term: String,
    visible: Option<VisibleResults>,
}

#[derive(Debug)]
pub struct SearchDebouncer {
    min_chars: usize,
    fields: Mutex<HashMap<String, FieldState>>,
}

impl SearchDebouncer {
    pub fn new(min_chars: usize) -> Self {
        Self {
            min_chars,
            fields: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new search. Terms below the minimum length, or equal to the
    /// last issued term, do not start a search.
    pub fn issue(&self, field: &str, term: &str) -> Option<SearchTicket> {
        let term = term.trim();
        if term.chars().count() < self.min_chars {
            return None;
        }

        let mut fields = self.fields.lock().unwrap_or_else(PoisonError::into_inner);
        let state = fields.entry(field.to_string()).or_default();
        if state.issued_term == term {
            return None;
        }
        state.issued_seq += 1;
        state.issued_term = term.to_string();

        Some(SearchTicket {
            field: field.to_string(),
            term: term.to_string(),
            seq: state.issued_seq,
        })
    }

    pub fn is_current(&self, ticket: &SearchTicket) -> bool {
        let fields = self.fields.lock().unwrap_or_else(PoisonError::into_inner);
        fields
            .get(&ticket.field)
            .is_some_and(|state| state.issued_seq == ticket.seq)
    }

    /// Apply `hits` if `ticket` is still the newest search for its field.
    /// Returns whether the visible state changed.
    pub fn complete(&self, ticket: &SearchTicket, hits: Vec<SearchHit>) -> bool {
        let mut fields = self.fields.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = fields.get_mut(&ticket.field) else {
            return false;
        };
        if state.issued_seq != ticket.seq {
            return false;
        }
        if state.visible.as_ref().is_some_and(|v| v.seq >= ticket.seq) {
            return false;
        }
        state.visible = Some(VisibleResults {
            term: ticket.term.clone(),
            seq: ticket.seq,
            hits,
        });
        true
    }

    pub fn visible(&self, field: &str) -> Option<VisibleResults> {
        let fields = self.fields.lock().unwrap_or_else(PoisonError::into_inner);
        fields.get(field).and_then(|state| state.visible.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(name: &str) -> SearchHit {
        SearchHit {
            name: name.to_string(),
            description: String::new(),
            stars: 0,
            official: false,
        }
    }

    #[test]
    fn short_and_repeated_terms_are_ignored() {
        let debouncer = SearchDebouncer::new(3);
        assert!(debouncer.issue("pull", "ng").is_none());
        assert!(debouncer.issue("pull", "ngi").is_some());
        assert!(debouncer.issue("pull", " ngi ").is_none());
    }

    #[test]
    fn late_response_does_not_overwrite_newer_one() {
        let debouncer = SearchDebouncer::new(3);
        let first = debouncer.issue("pull", "ngi").unwrap();
        let second = debouncer.issue("pull", "nginx").unwrap();
        assert!(second.seq > first.seq);

        // Second arrives first.
        assert!(debouncer.complete(&second, vec![hit("nginx")]));
        assert!(!debouncer.complete(&first, vec![hit("ngircd")]));

        let visible = debouncer.visible("pull").unwrap();
        assert_eq!(visible.term, "nginx");
        assert_eq!(visible.hits, vec![hit("nginx")]);
    }

    #[test]
    fn stale_response_is_dropped_even_if_first_to_arrive() {
        let debouncer = SearchDebouncer::new(3);
        let first = debouncer.issue("pull", "red").unwrap();
        let _second = debouncer.issue("pull", "redis").unwrap();
        assert!(!debouncer.is_current(&first));
        assert!(!debouncer.complete(&first, vec![hit("redmine")]));
        assert!(debouncer.visible("pull").is_none());
    }

    #[test]
    fn fields_are_independent() {
        let debouncer = SearchDebouncer::new(3);
        let a = debouncer.issue("pull", "postgres").unwrap();
        let b = debouncer.issue("run", "postgres").unwrap();
        assert!(debouncer.complete(&a, vec![hit("postgres")]));
        assert!(debouncer.complete(&b, vec![hit("postgres")]));
    }
}
