use std::collections::HashMap;

use super::conversion::RewriteContext;
use super::ir::Operation;
use super::ConversionResult;

/// Rewrites one op into ops legal for the current stage.
///
/// Returning `Ok(false)` means the pattern declined and the driver tries the
/// next one; anything the pattern emitted before declining is discarded.
pub trait ConversionPattern: Send + Sync {
    fn root(&self) -> &str;
    fn benefit(&self) -> u16 {
        1
    }
    fn match_and_rewrite(
        &self,
        op: &Operation,
        ctx: &mut RewriteContext<'_>,
    ) -> ConversionResult<bool>;
}

pub struct PatternSet {
    patterns: Vec<Box<dyn ConversionPattern>>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    pub fn add<P>(&mut self, pattern: P) -> &mut Self
    where
        P: ConversionPattern + 'static,
    {
        self.patterns.push(Box::new(pattern));
        self
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn freeze(mut self) -> FrozenPatternSet {
        // Stable sort keeps insertion order among equal benefits.
        self.patterns
            .sort_by_key(|pattern| std::cmp::Reverse(pattern.benefit()));
        let mut by_root: HashMap<String, Vec<Box<dyn ConversionPattern>>> = HashMap::new();
        for pattern in self.patterns {
            by_root
                .entry(pattern.root().to_string())
                .or_default()
                .push(pattern);
        }
        FrozenPatternSet { by_root }
    }
}

impl Default for PatternSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable patterns indexed by root op name.
pub struct FrozenPatternSet {
    by_root: HashMap<String, Vec<Box<dyn ConversionPattern>>>,
}

impl FrozenPatternSet {
    pub fn is_empty(&self) -> bool {
        self.by_root.is_empty()
    }

    pub fn matching(&self, op_name: &str) -> impl Iterator<Item = &dyn ConversionPattern> {
        self.by_root
            .get(op_name)
            .into_iter()
            .flatten()
            .map(|pattern| &**pattern)
    }

    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.by_root.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(u16);

    impl ConversionPattern for Named {
        fn root(&self) -> &str {
            "test.op"
        }

        fn benefit(&self) -> u16 {
            self.0
        }

        fn match_and_rewrite(
            &self,
            _op: &Operation,
            _ctx: &mut RewriteContext<'_>,
        ) -> ConversionResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn freeze_orders_by_descending_benefit() {
        let mut set = PatternSet::new();
        set.add(Named(1)).add(Named(5)).add(Named(3));
        let frozen = set.freeze();
        let order: Vec<u16> = frozen.matching("test.op").map(|pattern| pattern.benefit()).collect();
        assert_eq!(order, vec![5, 3, 1]);
        assert_eq!(frozen.matching("other.op").count(), 0);
    }
}
