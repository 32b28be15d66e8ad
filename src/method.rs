//! The nine request methods the engine accepts, plus a fixed-width set.

use http::Method;

pub const METHOD_COUNT: usize = 9;

static METHODS: [Method; METHOD_COUNT] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::CONNECT,
    Method::OPTIONS,
    Method::TRACE,
    Method::PATCH,
];

/// Index of a supported method, `None` for extension methods — the parser
/// turns those into 501 Not Implemented.
#[must_use]
pub fn method_index(method: &Method) -> Option<u16> {
    METHODS.iter().position(|m| m == method).map(|idx| idx as u16)
}

#[must_use]
pub fn method_from_token(token: &[u8]) -> Option<Method> {
    METHODS.iter().find(|m| m.as_str().as_bytes() == token).cloned()
}

/// Bitmap over the nine supported methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSet(u16);

impl MethodSet {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self((1 << METHOD_COUNT as u16) - 1);

    #[must_use]
    pub fn single(method: &Method) -> Self {
        let mut set = Self::EMPTY;
        set.insert(method);
        set
    }

    pub fn insert(&mut self, method: &Method) {
        if let Some(idx) = method_index(method) {
            self.0 |= 1 << idx;
        }
    }

    #[must_use]
    pub fn contains(&self, method: &Method) -> bool {
        method_index(method).is_some_and(|idx| self.0 & (1 << idx) != 0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for MethodSet {
    fn default() -> Self {
        Self::ALL
    }
}

impl FromIterator<Method> for MethodSet {
    fn from_iter<I: IntoIterator<Item = Method>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for method in iter {
            set.insert(&method);
        }
        set
    }
}

impl std::ops::BitOr for MethodSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
