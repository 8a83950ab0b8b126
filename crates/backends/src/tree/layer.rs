use kestrel_core::{key_depth, trim_key, CoreError, CoreResult, Layout};

/// Role of one depth of the watched subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layer {
    pub index: usize,
    pub name: &'static str,
    /// Nodes at this depth carry an encoded object.
    pub is_data: bool,
    pub watch_children: bool,
}

impl Layer {
    const fn containment(index: usize, name: &'static str) -> Self {
        Self { index, name, is_data: false, watch_children: true }
    }

    const fn data(index: usize) -> Self {
        Self { index, name: "instance", is_data: true, watch_children: false }
    }
}

/// Layer table for a watch rooted at `key` (relative to the backend prefix).
///
/// The root node of the watch sits at layer 0. An empty key watches every type, so it
/// gets an extra containment layer above the type layer.
pub fn layers_for(key: &str, layout: Layout) -> CoreResult<Vec<Layer>> {
    let mut names: Vec<&'static str> = match layout {
        Layout::Namespaced => vec!["type", "namespace"],
        Layout::Flat => vec!["type"],
    };
    if trim_key(key).is_empty() {
        names.insert(0, "root");
    } else {
        let skip = key_depth(key);
        if skip > names.len() {
            return Err(CoreError::InvalidKey(format!("{key}: too deep for a {layout:?} watch")));
        }
        names.drain(..skip);
    }
    let mut layers: Vec<Layer> = names.into_iter().enumerate().map(|(i, n)| Layer::containment(i, n)).collect();
    layers.push(Layer::data(layers.len()));
    Ok(layers)
}
