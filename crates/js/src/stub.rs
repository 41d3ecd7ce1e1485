//! Stub engine for tests and JS-less embeddings.
//!
//! Records every evaluation in order and interprets a tiny statement
//! subset so load-ordering tests can observe script effects without a
//! real engine:
//!
//! - `window.<name> = <number|string|true|false>;` stores a global in
//!   the shared [`HostSignals`].
//! - `location = '<url>';` raises a script-sourced navigation request.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::anyhow;
use log::debug;

use crate::{
    GlobalValue, HostSignals, JsEngine, NavigationRequest, NavigationSource,
};

/// One recorded evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvaluatedScript {
    pub url: String,
    pub source: String,
    pub module: bool,
}

pub struct StubEngine {
    signals: Rc<RefCell<HostSignals>>,
    /// Every evaluation, in execution order.
    pub evaluated: Vec<EvaluatedScript>,
    /// URL substrings whose evaluation should throw.
    failing: Vec<String>,
    microtask_checkpoints: u64,
}

impl StubEngine {
    #[inline]
    pub fn new(signals: Rc<RefCell<HostSignals>>) -> Self {
        Self {
            signals,
            evaluated: Vec::new(),
            failing: Vec::new(),
            microtask_checkpoints: 0,
        }
    }

    /// Make any script whose URL contains `pattern` throw on evaluation.
    pub fn fail_matching(&mut self, pattern: &str) {
        self.failing.push(pattern.to_owned());
    }

    /// URLs of evaluated scripts, in order.
    pub fn evaluated_urls(&self) -> Vec<String> {
        self.evaluated.iter().map(|e| e.url.clone()).collect()
    }

    /// Number of times the microtask queue was drained.
    #[inline]
    pub fn microtask_checkpoints(&self) -> u64 {
        self.microtask_checkpoints
    }

    fn interpret(&mut self, source: &str) {
        for raw in source.split(';') {
            let stmt = raw.trim();
            if let Some(rest) = stmt.strip_prefix("window.") {
                if let Some((name, value)) = rest.split_once('=') {
                    let name = name.trim();
                    if let Some(value) = parse_value(value.trim()) {
                        self.signals
                            .borrow_mut()
                            .globals
                            .insert(name.to_owned(), value);
                    }
                }
            } else if let Some(rhs) = stmt
                .strip_prefix("location")
                .and_then(|r| r.trim_start().strip_prefix('='))
            {
                if let Some(url) = parse_string(rhs.trim()) {
                    debug!("StubEngine: script requested navigation to {url}");
                    self.signals.borrow_mut().navigations.push(NavigationRequest {
                        url,
                        source: NavigationSource::Script,
                    });
                }
            }
        }
    }

    fn record(&mut self, source: &str, url: &str, module: bool) -> anyhow::Result<()> {
        if self.failing.iter().any(|p| url.contains(p.as_str())) {
            return Err(anyhow!("script threw: {url}"));
        }
        self.evaluated.push(EvaluatedScript {
            url: url.to_owned(),
            source: source.to_owned(),
            module,
        });
        self.interpret(source);
        Ok(())
    }
}

impl JsEngine for StubEngine {
    fn eval_script(&mut self, source: &str, url: &str) -> anyhow::Result<()> {
        self.record(source, url, false)
    }

    fn eval_module(&mut self, source: &str, url: &str, _cacheable: bool) -> anyhow::Result<()> {
        self.record(source, url, true)
    }

    fn run_microtasks(&mut self) -> anyhow::Result<()> {
        self.microtask_checkpoints += 1;
        Ok(())
    }
}

fn parse_string(token: &str) -> Option<String> {
    let inner = token
        .strip_prefix('\'')
        .and_then(|t| t.strip_suffix('\''))
        .or_else(|| token.strip_prefix('"').and_then(|t| t.strip_suffix('"')))?;
    Some(inner.to_owned())
}

fn parse_value(token: &str) -> Option<GlobalValue> {
    if let Some(text) = parse_string(token) {
        return Some(GlobalValue::Text(text));
    }
    match token {
        "true" => Some(GlobalValue::Bool(true)),
        "false" => Some(GlobalValue::Bool(false)),
        _ => token.parse::<f64>().ok().map(GlobalValue::Number),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order_and_sets_globals() {
        let signals = HostSignals::shared();
        let mut engine = StubEngine::new(Rc::clone(&signals));
        engine.eval_script("window.x = 1;", "inline://a").unwrap();
        engine.eval_script("window.s = 'hi';", "inline://b").unwrap();
        assert_eq!(engine.evaluated_urls(), ["inline://a", "inline://b"]);
        let signals = signals.borrow();
        assert_eq!(signals.globals.get("x"), Some(&GlobalValue::Number(1.0)));
        assert_eq!(
            signals.globals.get("s"),
            Some(&GlobalValue::Text("hi".to_owned()))
        );
    }

    #[test]
    fn modules_record_their_flavor() {
        let signals = HostSignals::shared();
        let mut engine = StubEngine::new(signals);
        engine
            .eval_module("export {}", "http://t/mod.js", true)
            .unwrap();
        assert!(engine.evaluated[0].module);
    }

    #[test]
    fn location_assignment_raises_navigation() {
        let signals = HostSignals::shared();
        let mut engine = StubEngine::new(Rc::clone(&signals));
        engine
            .eval_script("location = 'http://t/next';", "inline://nav")
            .unwrap();
        let signals = signals.borrow();
        assert_eq!(signals.navigations.len(), 1);
        assert_eq!(signals.navigations[0].url, "http://t/next");
        assert_eq!(signals.navigations[0].source, NavigationSource::Script);
    }

    #[test]
    fn failing_scripts_throw() {
        let signals = HostSignals::shared();
        let mut engine = StubEngine::new(signals);
        engine.fail_matching("/boom.js");
        assert!(engine.eval_script("x", "http://t/boom.js").is_err());
        assert!(engine.evaluated.is_empty());
    }
}
