/// file: src/types.rs
/// description: data model shared by the pool, the session state machine and grid consumers
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Which logical entity set backs a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridType {
    Portfolio,
    Primitives,
}

impl GridType {
    pub const ALL: [GridType; 2] = [GridType::Portfolio, GridType::Primitives];

    pub fn as_str(&self) -> &'static str {
        match self {
            GridType::Portfolio => "portfolio",
            GridType::Primitives => "primitives",
        }
    }
}

impl fmt::Display for GridType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GridType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "portfolio" => Ok(GridType::Portfolio),
            "primitives" => Ok(GridType::Primitives),
            other => Err(format!("unknown grid type '{other}'")),
        }
    }
}

/// Market data a view computes against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "marketDataType", rename_all = "camelCase")]
pub enum MarketDataSpec {
    Live {
        source: String,
    },
    Latest {
        snapshot_id: String,
    },
    Snapshot {
        snapshot_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FixedHistorical {
        date: NaiveDate,
        resolver_key: Option<String>,
    },
}

/// Identifies what data a consumer wants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    pub view_id: Option<String>,
    pub view_definition: Option<String>,
    #[serde(default)]
    pub aggregators: Vec<String>,
    #[serde(default)]
    pub market_data: Vec<MarketDataSpec>,
    #[serde(rename = "type")]
    pub grid_type: Option<GridType>,
    #[serde(default)]
    pub depgraph: bool,
    pub row: Option<u32>,
    pub col: Option<u32>,
    #[serde(default)]
    pub blotter: bool,
}

/// A source descriptor with the viewport-only fields stripped.
///
/// Two descriptors share a pooled parent exactly when their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    view_id: Option<String>,
    view_definition: Option<String>,
    aggregators: Vec<String>,
    market_data: Vec<MarketDataSpec>,
    blotter: bool,
}

impl SourceDescriptor {
    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            view_id: self.view_id.clone(),
            view_definition: self.view_definition.clone(),
            aggregators: self.aggregators.clone(),
            market_data: self.market_data.clone(),
            blotter: self.blotter,
        }
    }

    /// Descriptor a pooled parent is created from: the child's descriptor minus
    /// everything that only matters to a single viewport.
    pub fn parent_source(&self) -> SourceDescriptor {
        SourceDescriptor {
            grid_type: None,
            depgraph: false,
            row: None,
            col: None,
            ..self.clone()
        }
    }

    /// Descriptor for a consumer that attaches to an already resolved connection,
    /// e.g. the clipboard of a live grid.
    pub fn for_connection(&self, connection: &Connection) -> SourceDescriptor {
        SourceDescriptor {
            view_id: Some(connection.view_id.clone()),
            grid_type: Some(connection.grid_type),
            ..self.clone()
        }
    }

    pub fn view_request(&self) -> ViewRequest {
        ViewRequest {
            view_definition_id: self.view_definition.clone().unwrap_or_default(),
            aggregators: self.aggregators.clone(),
            market_data: self.market_data.clone(),
            blotter: self.blotter,
        }
    }
}

/// Body of the "create view" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewRequest {
    pub view_definition_id: String,
    pub aggregators: Vec<String>,
    pub market_data: Vec<MarketDataSpec>,
    pub blotter: bool,
}

/// The resolved server-side session a Data instance works against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub view_id: String,
    pub grid_type: GridType,
    pub graph_id: Option<String>,
    pub structure: Option<Structure>,
}

/// Node of the row tree: rows `start..=end` with nested child ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub start: u32,
    pub end: u32,
    pub children: Vec<Node>,
    pub collapsed: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNode {
    Full(u32, u32, Vec<Node>, bool),
    Plain(u32, u32, Vec<Node>),
    Leaf(u32, u32),
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let node = match RawNode::deserialize(deserializer)? {
            RawNode::Full(start, end, children, collapsed) => Node {
                start,
                end,
                children,
                collapsed,
            },
            RawNode::Plain(start, end, children) => Node {
                start,
                end,
                children,
                collapsed: false,
            },
            RawNode::Leaf(start, end) => Node {
                start,
                end,
                children: Vec::new(),
                collapsed: false,
            },
        };
        if node.end < node.start {
            return Err(serde::de::Error::custom(format!(
                "node range {}..{} is inverted",
                node.start, node.end
            )));
        }
        Ok(node)
    }
}

impl Serialize for Node {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (self.start, self.end, &self.children, self.collapsed).serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub header: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub value_type: Option<ValueType>,
    pub width: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSet {
    pub name: String,
    pub columns: Vec<Column>,
}

/// Column structure of a grid as returned by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Structure {
    #[serde(default)]
    pub row_count: Option<u32>,
    #[serde(default)]
    pub root_node: Option<Node>,
    #[serde(default)]
    pub column_sets: Vec<ColumnSet>,
}

impl Structure {
    /// Total number of data rows: the root node span wins over the raw count.
    pub fn data_rows(&self) -> u32 {
        match &self.root_node {
            Some(root) => root.end + 1,
            None => self.row_count.unwrap_or(0),
        }
    }

    /// A dry run against the wrong grid type comes back with neither rows nor columns.
    pub fn is_empty(&self) -> bool {
        self.data_rows() == 0 && self.column_sets.iter().all(|set| set.columns.is_empty())
    }
}

/// One row of the flattened structural tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeRow {
    pub row: u32,
    pub indent: u32,
    /// Present for rows that head a range of child rows.
    pub span: Option<(u32, u32)>,
    pub collapsed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnLayout {
    /// The primary entity's own columns.
    pub fixed: Vec<ColumnSet>,
    /// Every other column set.
    pub scroll: Vec<ColumnSet>,
}

impl ColumnLayout {
    pub fn fixed_length(&self) -> usize {
        self.fixed.iter().map(|set| set.columns.len()).sum()
    }

    pub fn scroll_length(&self) -> usize {
        self.scroll.iter().map(|set| set.columns.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.fixed_length() + self.scroll_length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All columns in display order, fixed first.
    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.fixed
            .iter()
            .chain(self.scroll.iter())
            .flat_map(|set| set.columns.iter())
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns().nth(index)
    }
}

/// Everything a grid consumer needs to lay itself out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub data_rows: u32,
    pub structure: Vec<TreeRow>,
    pub columns: ColumnLayout,
    pub grid_type: GridType,
    pub depgraph: bool,
}

impl Meta {
    pub fn from_structure(structure: &Structure, grid_type: GridType, depgraph: bool) -> Self {
        let mut rows = Vec::new();
        if let Some(root) = &structure.root_node {
            unravel(root, 0, &mut rows);
        }
        let mut sets = structure.column_sets.iter().cloned();
        let fixed = sets.next().into_iter().collect();
        Meta {
            data_rows: structure.data_rows(),
            structure: rows,
            columns: ColumnLayout {
                fixed,
                scroll: sets.collect(),
            },
            grid_type,
            depgraph,
        }
    }

    /// Row indices in display order.
    pub fn available_rows(&self) -> Vec<u32> {
        if self.structure.is_empty() {
            (0..self.data_rows).collect()
        } else {
            self.structure.iter().map(|row| row.row).collect()
        }
    }
}

fn unravel(node: &Node, indent: u32, out: &mut Vec<TreeRow>) {
    out.push(TreeRow {
        row: node.start,
        indent,
        span: (node.end > node.start).then_some((node.start, node.end)),
        collapsed: node.collapsed,
    });
    let leaf = |row: u32| TreeRow {
        row,
        indent: indent + 1,
        span: None,
        collapsed: false,
    };
    let mut cursor = node.start;
    for child in &node.children {
        out.extend((cursor + 1..child.start).map(leaf));
        unravel(child, indent + 1, out);
        cursor = child.end;
    }
    out.extend((cursor + 1..=node.end).map(leaf));
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ViewportFormat {
    #[default]
    Cell,
    Expanded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

/// The row/column window a consumer wants streamed. Replaced wholesale, never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub rows: Vec<u32>,
    pub cols: Vec<u32>,
    pub cells: Option<Vec<CellRef>>,
    pub format: ViewportFormat,
    pub log: bool,
}

impl Viewport {
    pub fn new(rows: Vec<u32>, cols: Vec<u32>) -> Self {
        Self {
            rows,
            cols,
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: ViewportFormat) -> Self {
        self.format = format;
        self
    }

    pub fn is_nonsensical(&self) -> bool {
        self.cells.is_none() && (self.rows.is_empty() || self.cols.is_empty())
    }

    pub fn cell_count(&self) -> usize {
        match &self.cells {
            Some(cells) => cells.len(),
            None => self.rows.len() * self.cols.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Double,
    Primitive,
    String,
    Curve,
    Matrix2d,
    LabelledMatrix1d,
    LabelledMatrix2d,
    SurfaceData,
    TimeSeries,
    #[serde(other)]
    Unknown,
}

/// A single computed value; `v` is a summary in cell mode and the full value in
/// expanded mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellValue {
    pub v: serde_json::Value,
    pub t: Option<ValueType>,
    /// History used for sparklines when the viewport asked for logging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub row: u32,
    pub col: u32,
    pub value: CellValue,
}

/// One atomic set of cell deltas bounded by a start/end control pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellBatch {
    pub viewport_id: String,
    pub version: u64,
    pub cells: Vec<CellUpdate>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl CellBatch {
    pub fn cell(&self, row: u32, col: u32) -> Option<&CellValue> {
        self.cells
            .iter()
            .find(|cell| cell.row == row && cell.col == col)
            .map(|cell| &cell.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn structure_with_root() -> Structure {
        serde_json::from_value(json!({
            "rootNode": [0, 6, [[1, 3, []], [5, 6, [], true]]],
            "columnSets": [
                {"name": "fixed", "columns": [{"header": "Label"}]},
                {"name": "risk", "columns": [{"header": "PV", "type": "DOUBLE"}, {"header": "Delta"}]},
                {"name": "curves", "columns": [{"header": "Yield", "type": "CURVE"}]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn pool_key_ignores_viewport_fields() {
        let a = SourceDescriptor {
            view_definition: Some("risk".into()),
            grid_type: Some(GridType::Portfolio),
            row: Some(1),
            col: Some(2),
            depgraph: true,
            ..Default::default()
        };
        let b = SourceDescriptor {
            view_definition: Some("risk".into()),
            ..Default::default()
        };
        assert_eq!(a.pool_key(), b.pool_key());

        let c = SourceDescriptor {
            aggregators: vec!["Currency".into()],
            ..b.clone()
        };
        assert_ne!(b.pool_key(), c.pool_key());
    }

    #[test]
    fn data_rows_prefers_root_node() {
        let mut structure = structure_with_root();
        structure.row_count = Some(100);
        assert_eq!(structure.data_rows(), 7);
        structure.root_node = None;
        assert_eq!(structure.data_rows(), 100);
        assert_eq!(Structure::default().data_rows(), 0);
        assert!(Structure::default().is_empty());
    }

    #[test]
    fn meta_flattens_tree_and_splits_columns() {
        let meta = Meta::from_structure(&structure_with_root(), GridType::Portfolio, false);
        let rows: Vec<_> = meta.structure.iter().map(|r| (r.row, r.indent)).collect();
        assert_eq!(
            rows,
            vec![(0, 0), (1, 1), (2, 2), (3, 2), (4, 1), (5, 1), (6, 2)]
        );
        assert_eq!(meta.structure[0].span, Some((0, 6)));
        assert!(meta.structure[5].collapsed);
        assert_eq!(meta.columns.fixed_length(), 1);
        assert_eq!(meta.columns.scroll_length(), 3);
        assert_eq!(meta.columns.column(1).map(|c| c.header.as_str()), Some("PV"));
        assert_eq!(meta.available_rows(), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn nonsensical_viewports() {
        assert!(Viewport::new(vec![], vec![]).is_nonsensical());
        assert!(Viewport::new(vec![1], vec![]).is_nonsensical());
        assert!(!Viewport::new(vec![1], vec![2]).is_nonsensical());
        let explicit = Viewport {
            cells: Some(vec![CellRef { row: 0, col: 0 }]),
            ..Viewport::default()
        };
        assert!(!explicit.is_nonsensical());
    }

    #[test]
    fn unknown_value_types_deserialize() {
        let value: CellValue = serde_json::from_value(json!({"v": 1.5, "t": "FUNKY"})).unwrap();
        assert_eq!(value.t, Some(ValueType::Unknown));
    }
}
