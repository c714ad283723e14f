//! Filter planning.
//!
//! A request carries up to two kinds of constraint: a spatial cut and an
//! attribute expression (temporal range and/or class set). The service
//! only ever sees one of them. When a cut exists its bounding box goes to
//! the server and the expression is deferred to the post-filter; without
//! a cut the expression goes to the server and is re-applied locally,
//! since services honour `CQL_FILTER` inconsistently.

use chrono::NaiveDate;
use geo::{Rect, coord};
use geoharvest_feature_models::{BBox, Crs, FilterSpec};
use geoharvest_spatial::Reprojector;
use serde::{Deserialize, Serialize};

use crate::ServiceError;
use crate::expression::Expression;
use crate::resolve::ResolvedEndpoint;

/// Half-width added to each side of a zero-width or zero-height extent.
pub const DEGENERATE_PAD: f64 = 1e-7;

/// A temporal constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum TemporalRange {
    /// Inclusive calendar dates.
    Dates {
        /// First day.
        start: NaiveDate,
        /// Last day.
        end: NaiveDate,
    },
    /// Inclusive reference years.
    Years {
        /// First year.
        start: i32,
        /// Last year.
        end: i32,
    },
}

impl TemporalRange {
    fn is_ordered(&self) -> bool {
        match self {
            Self::Dates { start, end } => start <= end,
            Self::Years { start, end } => start <= end,
        }
    }
}

/// Everything the planner needs to know about a request.
#[derive(Debug, Clone)]
pub struct PlanInput<'a> {
    /// Target layer, for its attribute field names.
    pub endpoint: &'a ResolvedEndpoint,
    /// Extent of the cut boundary, in the CRS given alongside it.
    pub cut_extent: Option<(Rect<f64>, Crs)>,
    /// Temporal constraint.
    pub temporal: Option<TemporalRange>,
    /// Class values to keep. Empty keeps every class.
    pub classes: Vec<String>,
    /// CRS the service expects `bbox` coordinates in.
    pub service_crs: Crs,
}

/// The planner's decision.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterPlan {
    /// What is sent to the server and what is kept back.
    pub spec: FilterSpec,
    /// Expression the post-filter applies after download.
    pub deferred: Option<Expression>,
}

/// Builds the attribute expression for the temporal and class
/// constraints, or `None` when there are none.
///
/// # Errors
///
/// Returns [`ServiceError::InvalidFilter`] if a constraint needs a field
/// the layer does not declare, or a range is reversed.
pub fn attribute_expression(input: &PlanInput<'_>) -> Result<Option<Expression>, ServiceError> {
    let endpoint = input.endpoint;
    let mut terms = Vec::new();

    if let Some(range) = input.temporal {
        if !range.is_ordered() {
            return Err(ServiceError::InvalidFilter {
                message: format!("temporal range {range:?} ends before it starts"),
            });
        }
        let term = match (range, &endpoint.year_field, &endpoint.date_field) {
            (TemporalRange::Years { start, end }, Some(field), _) => {
                Expression::between(field.as_str(), start, end)
            }
            (TemporalRange::Years { start, end }, None, Some(field)) => {
                let (Some(first), Some(last)) = (
                    NaiveDate::from_ymd_opt(start, 1, 1),
                    NaiveDate::from_ymd_opt(end, 12, 31),
                ) else {
                    return Err(ServiceError::InvalidFilter {
                        message: format!("years {start}..{end} are out of range"),
                    });
                };
                Expression::between(field.as_str(), first, last)
            }
            (TemporalRange::Dates { start, end }, _, Some(field)) => {
                Expression::between(field.as_str(), start, end)
            }
            (_, _, None) => {
                return Err(ServiceError::InvalidFilter {
                    message: format!("{} has no date field", endpoint.type_name),
                });
            }
        };
        terms.push(term);
    }

    if !input.classes.is_empty() {
        let Some(field) = &endpoint.class_field else {
            return Err(ServiceError::InvalidFilter {
                message: format!("{} has no class field", endpoint.type_name),
            });
        };
        terms.push(Expression::in_list(field.as_str(), input.classes.iter().cloned()));
    }

    Ok(Expression::and(terms))
}

/// Reprojects a cut extent into the service CRS, padding degenerate
/// extents so the box keeps a positive area.
///
/// # Errors
///
/// Returns [`ServiceError::Spatial`] if the extent cannot be reprojected.
pub fn server_bbox(extent: Rect<f64>, from: Crs, service_crs: Crs) -> Result<BBox, ServiceError> {
    let rect = Reprojector::new(from, service_crs)?.rect(extent)?;
    let (mut min, mut max) = (rect.min(), rect.max());
    if max.x - min.x <= 0.0 {
        min.x -= DEGENERATE_PAD;
        max.x += DEGENERATE_PAD;
    }
    if max.y - min.y <= 0.0 {
        min.y -= DEGENERATE_PAD;
        max.y += DEGENERATE_PAD;
    }
    Ok(BBox::from_rect(
        Rect::new(coord! { x: min.x, y: min.y }, coord! { x: max.x, y: max.y }),
        service_crs,
    ))
}

/// Decides which constraint the server evaluates.
///
/// # Errors
///
/// Returns [`ServiceError::InvalidFilter`] or [`ServiceError::Spatial`]
/// from [`attribute_expression`] and [`server_bbox`].
pub fn plan(input: &PlanInput<'_>) -> Result<FilterPlan, ServiceError> {
    let expression = attribute_expression(input)?;
    let bbox = input
        .cut_extent
        .map(|(rect, crs)| server_bbox(rect, crs, input.service_crs))
        .transpose()?;

    let spec = match (bbox, &expression) {
        (None, None) => FilterSpec::None,
        (Some(bbox), None) => FilterSpec::SpatialBBox { bbox },
        (None, Some(expr)) => FilterSpec::AttributeExpression {
            expression: expr.to_string(),
        },
        (Some(bbox), Some(expr)) => FilterSpec::Combined {
            bbox,
            deferred: expr.to_string(),
        },
    };
    log::debug!("Filter plan for {}: {spec}", input.endpoint.type_name);

    Ok(FilterPlan {
        spec,
        deferred: expression,
    })
}
