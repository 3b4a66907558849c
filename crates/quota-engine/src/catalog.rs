//! Static plan catalog
//!
//! Loaded once at process start, either from the built-in plans or from a
//! YAML file shaped like `config/plans.example.yaml`.

use quota_common::{Period, QuotaError, ServiceId, TierName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read plan catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid plan catalog YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Service {0} is missing from the plan catalog")]
    MissingService(ServiceId),
    #[error("Service {service} is missing the {tier} tier")]
    MissingTier { service: ServiceId, tier: TierName },
    #[error("Tier {service}/{tier} must use a {expected} period")]
    WrongPeriod {
        service: ServiceId,
        tier: TierName,
        expected: Period,
    },
    #[error("Price id {price_id} is listed on more than one {service} tier")]
    DuplicatePrice { service: ServiceId, price_id: String },
}

impl From<CatalogError> for QuotaError {
    fn from(err: CatalogError) -> Self {
        QuotaError::Catalog(err.to_string())
    }
}

/// One entitlement level of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTier {
    pub service: ServiceId,
    pub tier: TierName,
    pub limit: u64,
    pub period: Period,
    pub price_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TierSpec {
    limit: u64,
    period: Period,
    #[serde(default)]
    price_ids: Vec<String>,
}

#[derive(Debug, Clone)]
struct ServicePlans {
    free: PlanTier,
    plus: PlanTier,
    pro: PlanTier,
}

impl ServicePlans {
    fn get(&self, tier: TierName) -> &PlanTier {
        match tier {
            TierName::Free => &self.free,
            TierName::Plus => &self.plus,
            TierName::Pro => &self.pro,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanCatalog {
    services: HashMap<ServiceId, ServicePlans>,
}

impl PlanCatalog {
    /// Plans compiled into the binary.
    pub fn builtin() -> Self {
        let mut services = HashMap::new();
        services.insert(
            ServiceId::Youtube,
            builtin_plans(ServiceId::Youtube, 100, 5000, 20000),
        );
        services.insert(
            ServiceId::Zillow,
            builtin_plans(ServiceId::Zillow, 100, 2000, 10000),
        );
        Self { services }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, CatalogError> {
        let specs: HashMap<ServiceId, HashMap<TierName, TierSpec>> = serde_yaml::from_str(raw)?;
        let mut services = HashMap::new();

        for service in ServiceId::ALL {
            let mut tiers = specs
                .get(&service)
                .ok_or(CatalogError::MissingService(service))?
                .iter()
                .map(|(tier, spec)| {
                    (
                        *tier,
                        PlanTier {
                            service,
                            tier: *tier,
                            limit: spec.limit,
                            period: spec.period,
                            price_ids: spec.price_ids.clone(),
                        },
                    )
                })
                .collect::<HashMap<_, _>>();

            let mut take = |tier: TierName| {
                tiers
                    .remove(&tier)
                    .ok_or(CatalogError::MissingTier { service, tier })
            };
            let plans = ServicePlans {
                free: take(TierName::Free)?,
                plus: take(TierName::Plus)?,
                pro: take(TierName::Pro)?,
            };
            validate(&plans)?;
            services.insert(service, plans);
        }

        Ok(Self { services })
    }

    pub fn tier(&self, service: ServiceId, tier: TierName) -> Result<&PlanTier, CatalogError> {
        self.services
            .get(&service)
            .map(|plans| plans.get(tier))
            .ok_or(CatalogError::MissingService(service))
    }

    /// Tiers of one service, cheapest first.
    pub fn tiers(&self, service: ServiceId) -> Vec<&PlanTier> {
        self.services
            .get(&service)
            .map(|plans| vec![&plans.free, &plans.plus, &plans.pro])
            .unwrap_or_default()
    }

    /// Map a billing price id to the tier it buys.
    ///
    /// Price ids listed on neither paid tier resolve to `plus`. Historical
    /// price ids retired from the catalog keep their paid access this way.
    pub fn tier_for_price(&self, service: ServiceId, price_id: &str) -> TierName {
        if let Some(plans) = self.services.get(&service) {
            if plans.plus.price_ids.iter().any(|p| p == price_id) {
                return TierName::Plus;
            }
            if plans.pro.price_ids.iter().any(|p| p == price_id) {
                return TierName::Pro;
            }
        }

        warn!(
            service = %service,
            price_id = %price_id,
            "Unknown price id, assuming plus tier"
        );
        TierName::Plus
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_plans(service: ServiceId, free: u64, plus: u64, pro: u64) -> ServicePlans {
    let paid = |tier: TierName, limit: u64| PlanTier {
        service,
        tier,
        limit,
        period: Period::Monthly,
        price_ids: vec![format!("price_{service}_{tier}_monthly")],
    };

    ServicePlans {
        free: PlanTier {
            service,
            tier: TierName::Free,
            limit: free,
            period: Period::Daily,
            price_ids: Vec::new(),
        },
        plus: paid(TierName::Plus, plus),
        pro: paid(TierName::Pro, pro),
    }
}

fn validate(plans: &ServicePlans) -> Result<(), CatalogError> {
    let expect_period = |plan: &PlanTier, expected: Period| {
        if plan.period == expected {
            Ok(())
        } else {
            Err(CatalogError::WrongPeriod {
                service: plan.service,
                tier: plan.tier,
                expected,
            })
        }
    };
    expect_period(&plans.free, Period::Daily)?;
    expect_period(&plans.plus, Period::Monthly)?;
    expect_period(&plans.pro, Period::Monthly)?;

    if let Some(price_id) = plans
        .plus
        .price_ids
        .iter()
        .find(|p| plans.pro.price_ids.contains(p))
    {
        return Err(CatalogError::DuplicatePrice {
            service: plans.plus.service,
            price_id: price_id.clone(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = include_str!("../../../config/plans.example.yaml");

    #[test]
    fn test_example_file_matches_builtin() {
        let parsed = PlanCatalog::from_yaml_str(EXAMPLE).unwrap();
        let builtin = PlanCatalog::builtin();
        for service in ServiceId::ALL {
            assert_eq!(parsed.tiers(service), builtin.tiers(service));
        }
    }

    #[test]
    fn test_tier_lookup() {
        let catalog = PlanCatalog::builtin();
        let plus = catalog.tier(ServiceId::Youtube, TierName::Plus).unwrap();
        assert_eq!(plus.limit, 5000);
        assert_eq!(plus.period, Period::Monthly);

        let free = catalog.tier(ServiceId::Zillow, TierName::Free).unwrap();
        assert_eq!(free.limit, 100);
        assert_eq!(free.period, Period::Daily);
    }

    #[test]
    fn test_price_maps_to_tier() {
        let catalog = PlanCatalog::builtin();
        assert_eq!(
            catalog.tier_for_price(ServiceId::Youtube, "price_youtube_pro_monthly"),
            TierName::Pro
        );
        assert_eq!(
            catalog.tier_for_price(ServiceId::Zillow, "price_zillow_plus_monthly"),
            TierName::Plus
        );
    }

    #[test]
    fn test_unknown_price_falls_back_to_plus() {
        // Retired or foreign price ids are not an error: they buy the plus tier.
        let catalog = PlanCatalog::builtin();
        assert_eq!(
            catalog.tier_for_price(ServiceId::Youtube, "price_legacy_2021"),
            TierName::Plus
        );
        // A price of the other tenant is unknown here as well.
        assert_eq!(
            catalog.tier_for_price(ServiceId::Youtube, "price_zillow_pro_monthly"),
            TierName::Plus
        );
    }

    #[test]
    fn test_free_tier_must_be_daily() {
        let raw = EXAMPLE.replacen("period: daily", "period: monthly", 1);
        let err = PlanCatalog::from_yaml_str(&raw).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::WrongPeriod {
                tier: TierName::Free,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_service_rejected() {
        let raw = "youtube:\n  free: { limit: 1, period: daily }\n";
        let err = PlanCatalog::from_yaml_str(raw).unwrap_err();
        assert!(matches!(err, CatalogError::MissingTier { .. }));
    }

    #[test]
    fn test_duplicate_price_rejected() {
        let raw = EXAMPLE.replace("price_zillow_pro_monthly", "price_zillow_plus_monthly");
        let err = PlanCatalog::from_yaml_str(&raw).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicatePrice { .. }));
    }
}
