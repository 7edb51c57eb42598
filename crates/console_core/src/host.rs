use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, PoisonError,
};

/// Page-level side effects the console cannot perform on the document
/// itself.
pub trait PageHost: Send + Sync {
    fn reload(&self);
    fn navigate(&self, url: &str);
    /// Blocking alert.
    fn alert(&self, message: &str);
    fn confirm(&self, message: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEffect {
    Reload,
    Navigate(String),
    Alert(String),
    Confirm(String),
}

/// Host for headless embedding: records every effect and answers
/// confirmations with a fixed reply.
pub struct HeadlessHost {
    effects: Mutex<Vec<PageEffect>>,
    confirm_answer: AtomicBool,
}

impl Default for HeadlessHost {
    fn default() -> Self {
        Self::new(true)
    }
}

impl HeadlessHost {
    pub fn new(confirm_answer: bool) -> Self {
        Self {
            effects: Mutex::new(Vec::new()),
            confirm_answer: AtomicBool::new(confirm_answer),
        }
    }

    pub fn set_confirm_answer(&self, answer: bool) {
        self.confirm_answer.store(answer, Ordering::SeqCst);
    }

    pub fn effects(&self) -> Vec<PageEffect> {
        self.effects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reload_count(&self) -> usize {
        self.effects()
            .iter()
            .filter(|effect| **effect == PageEffect::Reload)
            .count()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.effects()
            .into_iter()
            .filter_map(|effect| match effect {
                PageEffect::Navigate(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    fn record(&self, effect: PageEffect) {
        self.effects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(effect);
    }
}

impl PageHost for HeadlessHost {
    fn reload(&self) {
        self.record(PageEffect::Reload);
    }

    fn navigate(&self, url: &str) {
        self.record(PageEffect::Navigate(url.to_string()));
    }

    fn alert(&self, message: &str) {
        self.record(PageEffect::Alert(message.to_string()));
    }

    fn confirm(&self, message: &str) -> bool {
        self.record(PageEffect::Confirm(message.to_string()));
        self.confirm_answer.load(Ordering::SeqCst)
    }
}
