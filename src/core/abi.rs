// Host instruction-set preference ordering for shared-object variants.

/// Supported ABI tags in host preference order, most preferred first.
///
/// Ranking is a pure function of the ordering: the same order and candidate
/// always yield the same rank, which is what makes variant selection during
/// provisioning deterministic.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AbiOrder {
    tags: Vec<String>,
}

impl AbiOrder {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    /// Preference order for the ABI the running process was built for.
    pub fn host() -> Self {
        Self::new(host_tags())
    }

    /// Rank of `tag` in this order; lower is more preferred. `None` means
    /// the tag is unsupported on this host.
    pub fn rank(&self, tag: &str) -> Option<usize> {
        self.tags.iter().position(|supported| supported == tag)
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

fn host_tags() -> Vec<&'static str> {
    if cfg!(target_arch = "aarch64") {
        vec!["arm64-v8a"]
    } else if cfg!(target_arch = "arm") {
        vec!["armeabi-v7a", "armeabi"]
    } else if cfg!(target_arch = "x86_64") {
        vec!["x86_64", "x86"]
    } else if cfg!(target_arch = "x86") {
        vec!["x86"]
    } else {
        Vec::new()
    }
}
