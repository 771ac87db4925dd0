/// SQL generation: filter translation, statement building, join planning,
/// virtual tables and the aggregate request model

pub mod aggregate;
pub mod builder;
pub mod join;
pub mod query;
pub mod translator;
pub mod virtual_table;

pub use aggregate::{Accumulator, AggregateKind, AggregateRequest, AggregateValue, GroupResult, GroupedAccumulator};
pub use builder::{KeyValue, Paging, SelectRequest, SqlStatement, StatementBuilder, TableSource, DEFAULT_KEY_COLUMN};
pub use join::{JoinBranch, JoinInfo, JoinPlanner};
pub use query::{Join, JoinKind, Query, QueryHints, SortBy, SortOrder};
pub use translator::{map_enum_literals, BoundValue, FilterToSql, FilterTranslation, TableScope};
pub use virtual_table::{VirtualGeometry, VirtualTable, VirtualTableParameter, WHERE_PLACEHOLDER};
