//! Rollup (schema) description forwarded to beam construction.
//!
//! The router never interprets a [`Rollup`]; it is validated once, then
//! handed to every beam the factory builds. Dimension handling comes in
//! three shapes, modelled as variants:
//!
//! - specific: an explicit list of dimension columns
//! - schemaless: every column is a dimension
//! - schemaless with exclusions: every column except the listed ones
//!
//! Each shape may also carry spatial dimensions.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::ConfigError;
use crate::granularity::Granularity;

/// A spatial dimension built from one or more input fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SpatialDimension {
  /// The input already holds the coordinates, e.g. `"1.5,2.0"`.
  #[serde(rename_all = "camelCase")]
  SingleField {
    /// Output dimension name.
    dim_name: String,
  },
  /// Coordinates are assembled from several input fields.
  #[serde(rename_all = "camelCase")]
  MultipleField {
    /// Output dimension name.
    dim_name: String,
    /// Input fields, in coordinate order.
    dims: Vec<String>,
  },
}

impl SpatialDimension {
  /// Spatial dimension read from one field.
  pub fn single_field(dim_name: impl Into<String>) -> Self {
    SpatialDimension::SingleField {
      dim_name: dim_name.into(),
    }
  }

  /// Spatial dimension assembled from several fields.
  pub fn multiple_field(dim_name: impl Into<String>, dims: Vec<String>) -> Self {
    SpatialDimension::MultipleField {
      dim_name: dim_name.into(),
      dims,
    }
  }

  /// Output dimension name.
  pub fn dim_name(&self) -> &str {
    match self {
      SpatialDimension::SingleField { dim_name } | SpatialDimension::MultipleField { dim_name, .. } => {
        dim_name
      }
    }
  }
}

/// How input columns become dimensions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Dimensions {
  /// Only the listed columns are dimensions.
  #[serde(rename_all = "camelCase")]
  Specific {
    /// Dimension column names.
    dimensions: Vec<String>,
    /// Spatial dimensions.
    #[serde(default)]
    spatial_dimensions: Vec<SpatialDimension>,
  },
  /// Every column not excluded is a dimension.
  #[serde(rename_all = "camelCase")]
  Schemaless {
    /// Columns that are never dimensions.
    #[serde(default)]
    dimension_exclusions: Vec<String>,
    /// Spatial dimensions.
    #[serde(default)]
    spatial_dimensions: Vec<SpatialDimension>,
  },
}

impl Dimensions {
  /// An explicit dimension list.
  pub fn specific(dimensions: Vec<String>) -> Self {
    Dimensions::Specific {
      dimensions,
      spatial_dimensions: Vec::new(),
    }
  }

  /// Every column is a dimension.
  pub fn schemaless() -> Self {
    Self::schemaless_with_exclusions(Vec::new())
  }

  /// Every column except `exclusions` is a dimension.
  pub fn schemaless_with_exclusions(exclusions: Vec<String>) -> Self {
    Dimensions::Schemaless {
      dimension_exclusions: exclusions,
      spatial_dimensions: Vec::new(),
    }
  }

  /// Replaces the spatial dimensions.
  pub fn with_spatial_dimensions(self, spatial: Vec<SpatialDimension>) -> Self {
    match self {
      Dimensions::Specific { dimensions, .. } => Dimensions::Specific {
        dimensions,
        spatial_dimensions: spatial,
      },
      Dimensions::Schemaless {
        dimension_exclusions,
        ..
      } => Dimensions::Schemaless {
        dimension_exclusions,
        spatial_dimensions: spatial,
      },
    }
  }

  /// Spatial dimensions of either shape.
  pub fn spatial_dimensions(&self) -> &[SpatialDimension] {
    match self {
      Dimensions::Specific {
        spatial_dimensions, ..
      }
      | Dimensions::Schemaless {
        spatial_dimensions, ..
      } => spatial_dimensions,
    }
  }

  /// Explicit dimension names, if this is a specific list.
  pub fn specific_names(&self) -> Option<&[String]> {
    match self {
      Dimensions::Specific { dimensions, .. } => Some(dimensions),
      Dimensions::Schemaless { .. } => None,
    }
  }

  /// Excluded column names, if this is schemaless.
  pub fn exclusions(&self) -> Option<&[String]> {
    match self {
      Dimensions::Specific { .. } => None,
      Dimensions::Schemaless {
        dimension_exclusions,
        ..
      } => Some(dimension_exclusions),
    }
  }

  fn validate(&self) -> Result<(), ConfigError> {
    let names = match self {
      Dimensions::Specific { dimensions, .. } => {
        if dimensions.is_empty() {
          return Err(ConfigError::Rollup(
            "specific dimensions must not be empty".into(),
          ));
        }
        dimensions
      }
      Dimensions::Schemaless {
        dimension_exclusions,
        ..
      } => dimension_exclusions,
    };
    ensure_unique("dimension", names.iter().map(String::as_str))?;

    let mut spatial = HashSet::new();
    for dim in self.spatial_dimensions() {
      if !spatial.insert(dim.dim_name()) {
        return Err(ConfigError::Rollup(format!(
          "duplicate spatial dimension {:?}",
          dim.dim_name()
        )));
      }
      if let SpatialDimension::MultipleField { dim_name, dims } = dim
        && dims.is_empty()
      {
        return Err(ConfigError::Rollup(format!(
          "spatial dimension {:?} has no input fields",
          dim_name
        )));
      }
      if let Dimensions::Specific { dimensions, .. } = self
        && dimensions.iter().any(|d| d == dim.dim_name())
      {
        return Err(ConfigError::Rollup(format!(
          "spatial dimension {:?} is also a regular dimension",
          dim.dim_name()
        )));
      }
    }
    Ok(())
  }
}

impl From<Vec<String>> for Dimensions {
  fn from(dimensions: Vec<String>) -> Self {
    Dimensions::specific(dimensions)
  }
}

/// A metric aggregator applied during rollup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Aggregator {
  /// Counts input rows.
  Count {
    /// Output metric name.
    name: String,
  },
  /// Sums an integer field.
  #[serde(rename_all = "camelCase")]
  LongSum {
    /// Output metric name.
    name: String,
    /// Input field.
    field_name: String,
  },
  /// Sums a floating-point field.
  #[serde(rename_all = "camelCase")]
  DoubleSum {
    /// Output metric name.
    name: String,
    /// Input field.
    field_name: String,
  },
  /// Minimum of a numeric field.
  #[serde(rename_all = "camelCase")]
  Min {
    /// Output metric name.
    name: String,
    /// Input field.
    field_name: String,
  },
  /// Maximum of a numeric field.
  #[serde(rename_all = "camelCase")]
  Max {
    /// Output metric name.
    name: String,
    /// Input field.
    field_name: String,
  },
  /// Approximate distinct count of a field.
  #[serde(rename_all = "camelCase")]
  HyperUnique {
    /// Output metric name.
    name: String,
    /// Input field.
    field_name: String,
  },
}

impl Aggregator {
  /// Row counter named `name`.
  pub fn count(name: impl Into<String>) -> Self {
    Aggregator::Count { name: name.into() }
  }

  /// Output metric name.
  pub fn name(&self) -> &str {
    match self {
      Aggregator::Count { name }
      | Aggregator::LongSum { name, .. }
      | Aggregator::DoubleSum { name, .. }
      | Aggregator::Min { name, .. }
      | Aggregator::Max { name, .. }
      | Aggregator::HyperUnique { name, .. } => name,
    }
  }
}

/// Complete rollup description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollup {
  dimensions: Dimensions,
  aggregators: Vec<Aggregator>,
  query_granularity: Granularity,
}

impl Rollup {
  /// Builds and validates a rollup.
  pub fn create(
    dimensions: impl Into<Dimensions>,
    aggregators: Vec<Aggregator>,
    query_granularity: Granularity,
  ) -> Result<Self, ConfigError> {
    let rollup = Self {
      dimensions: dimensions.into(),
      aggregators,
      query_granularity,
    };
    rollup.validate()?;
    Ok(rollup)
  }

  /// Checks dimensions and aggregators for conflicts.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.aggregators.is_empty() {
      return Err(ConfigError::Rollup("at least one aggregator is required".into()));
    }
    ensure_unique("aggregator", self.aggregators.iter().map(Aggregator::name))?;
    self.dimensions.validate()?;
    if let Some(dims) = self.dimensions.specific_names()
      && let Some(clash) = self
        .aggregators
        .iter()
        .find(|a| dims.iter().any(|d| d == a.name()))
    {
      return Err(ConfigError::Rollup(format!(
        "{:?} is both a dimension and an aggregator",
        clash.name()
      )));
    }
    Ok(())
  }

  /// Checks that rows are not truncated more coarsely than segments.
  pub fn validate_against(&self, segment_granularity: Granularity) -> Result<(), ConfigError> {
    if self.query_granularity > segment_granularity {
      return Err(ConfigError::Rollup(format!(
        "query granularity {} is coarser than segment granularity {}",
        self.query_granularity, segment_granularity
      )));
    }
    Ok(())
  }

  /// Dimension description.
  pub fn dimensions(&self) -> &Dimensions {
    &self.dimensions
  }

  /// Aggregators.
  pub fn aggregators(&self) -> &[Aggregator] {
    &self.aggregators
  }

  /// Granularity rows are truncated to.
  pub fn query_granularity(&self) -> Granularity {
    self.query_granularity
  }
}

fn ensure_unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
  let mut seen = HashSet::new();
  for name in names {
    if !seen.insert(name) {
      return Err(ConfigError::Rollup(format!("duplicate {} {:?}", kind, name)));
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn dims() -> Vec<String> {
    vec!["column".to_string()]
  }

  fn aggs() -> Vec<Aggregator> {
    vec![Aggregator::count("cnt")]
  }

  #[test]
  fn test_specific_dimensions_rollup() {
    let rollup = Rollup::create(Dimensions::specific(dims()), aggs(), Granularity::Minute).unwrap();
    assert_eq!(
      rollup.dimensions().specific_names().unwrap()[0],
      "column"
    );
    assert_eq!(rollup.query_granularity(), Granularity::Minute);

    // A bare list means specific dimensions.
    let from_list = Rollup::create(dims(), aggs(), Granularity::Minute).unwrap();
    assert_eq!(from_list, rollup);
  }

  #[test]
  fn test_schemaless_dimensions_rollup() {
    let rollup = Rollup::create(Dimensions::schemaless(), aggs(), Granularity::Minute).unwrap();
    assert_eq!(rollup.dimensions().exclusions().unwrap().len(), 0);
    assert!(rollup.dimensions().specific_names().is_none());
  }

  #[test]
  fn test_schemaless_with_exclusions_rollup() {
    let rollup = Rollup::create(
      Dimensions::schemaless_with_exclusions(dims()),
      aggs(),
      Granularity::Minute,
    )
    .unwrap();
    assert_eq!(rollup.dimensions().exclusions().unwrap()[0], "column");
  }

  #[test]
  fn test_schemaless_with_spatial_dimensions() {
    let rollup = Rollup::create(
      Dimensions::schemaless_with_exclusions(dims()).with_spatial_dimensions(vec![
        SpatialDimension::multiple_field("coord.geo", vec!["lat".into(), "lon".into()]),
      ]),
      aggs(),
      Granularity::Minute,
    )
    .unwrap();
    assert_eq!(rollup.dimensions().exclusions().unwrap()[0], "column");
    let spatial = &rollup.dimensions().spatial_dimensions()[0];
    assert_eq!(spatial.dim_name(), "coord.geo");
    assert!(matches!(spatial, SpatialDimension::MultipleField { dims, .. } if dims.len() == 2));
  }

  #[test]
  fn test_rollup_validation() {
    assert!(Rollup::create(dims(), vec![], Granularity::Minute).is_err());
    assert!(Rollup::create(Vec::<String>::new(), aggs(), Granularity::Minute).is_err());
    assert!(
      Rollup::create(
        vec!["a".to_string(), "a".to_string()],
        aggs(),
        Granularity::Minute
      )
      .is_err()
    );
    assert!(
      Rollup::create(
        dims(),
        vec![Aggregator::count("cnt"), Aggregator::count("cnt")],
        Granularity::Minute
      )
      .is_err()
    );
    assert!(Rollup::create(dims(), vec![Aggregator::count("column")], Granularity::Minute).is_err());
    assert!(
      Rollup::create(
        Dimensions::specific(dims())
          .with_spatial_dimensions(vec![SpatialDimension::single_field("column")]),
        aggs(),
        Granularity::Minute
      )
      .is_err()
    );
    assert!(
      Rollup::create(
        Dimensions::schemaless()
          .with_spatial_dimensions(vec![SpatialDimension::multiple_field("geo", vec![])]),
        aggs(),
        Granularity::Minute
      )
      .is_err()
    );
  }

  #[test]
  fn test_query_granularity_against_segment() {
    let rollup = Rollup::create(dims(), aggs(), Granularity::Day).unwrap();
    assert!(rollup.validate_against(Granularity::Day).is_ok());
    assert!(rollup.validate_against(Granularity::Hour).is_err());
  }

  #[test]
  fn test_rollup_serde_shape() {
    let rollup = Rollup::create(
      Dimensions::schemaless().with_spatial_dimensions(vec![SpatialDimension::single_field("geo")]),
      vec![
        Aggregator::count("cnt"),
        Aggregator::LongSum {
          name: "total".into(),
          field_name: "value".into(),
        },
      ],
      Granularity::Minute,
    )
    .unwrap();
    let json = serde_json::to_value(&rollup).unwrap();
    assert_eq!(json["dimensions"]["type"], "schemaless");
    assert_eq!(json["dimensions"]["spatialDimensions"][0]["type"], "singleField");
    assert_eq!(json["aggregators"][1]["type"], "longSum");
    assert_eq!(json["aggregators"][1]["fieldName"], "value");
    assert_eq!(json["queryGranularity"], "MINUTE");

    let back: Rollup = serde_json::from_value(json).unwrap();
    assert_eq!(back, rollup);
  }
}
