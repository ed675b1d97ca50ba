//! Cacheable read resources.
//!
//! Each [`CacheResource`] has a base TTL and an optional scope used for
//! bulk invalidation. [`ResourceParams`] carries the values a resource key is
//! built from.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheResource {
    ProfileSummary,
    AchievementsPage,
    ExerciseCatalog,
    ExerciseList,
    DailyAdviceList,
    Reports,
    TrainingDisciplines,
    TrainingPrograms,
    AssistantNotesPage,
    AiAdvisorAdvice,
}

impl CacheResource {
    pub const ALL: [CacheResource; 10] = [
        CacheResource::ProfileSummary,
        CacheResource::AchievementsPage,
        CacheResource::ExerciseCatalog,
        CacheResource::ExerciseList,
        CacheResource::DailyAdviceList,
        CacheResource::Reports,
        CacheResource::TrainingDisciplines,
        CacheResource::TrainingPrograms,
        CacheResource::AssistantNotesPage,
        CacheResource::AiAdvisorAdvice,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CacheResource::ProfileSummary => "profileSummary",
            CacheResource::AchievementsPage => "achievementsPage",
            CacheResource::ExerciseCatalog => "exerciseCatalog",
            CacheResource::ExerciseList => "exerciseList",
            CacheResource::DailyAdviceList => "dailyAdviceList",
            CacheResource::Reports => "reports",
            CacheResource::TrainingDisciplines => "trainingDisciplines",
            CacheResource::TrainingPrograms => "trainingPrograms",
            CacheResource::AssistantNotesPage => "assistantNotesPage",
            CacheResource::AiAdvisorAdvice => "aiAdvisorAdvice",
        }
    }

    /// TTL before the adaptive multiplier is applied.
    pub fn base_ttl(self) -> Duration {
        let secs = match self {
            CacheResource::ProfileSummary => 120,
            CacheResource::AchievementsPage => 300,
            CacheResource::ExerciseCatalog => 90,
            CacheResource::ExerciseList => 45,
            CacheResource::DailyAdviceList => 600,
            CacheResource::Reports => 300,
            CacheResource::TrainingDisciplines => 300,
            CacheResource::TrainingPrograms => 300,
            CacheResource::AssistantNotesPage => 120,
            CacheResource::AiAdvisorAdvice => 45,
        };
        Duration::from_secs(secs)
    }

    /// Whether keys of this resource carry a scope version segment.
    pub fn is_scoped(self) -> bool {
        !matches!(
            self,
            CacheResource::ProfileSummary
                | CacheResource::TrainingDisciplines
                | CacheResource::TrainingPrograms
        )
    }
}

impl fmt::Display for CacheResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CacheResource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheResource::ALL
            .into_iter()
            .find(|resource| resource.name() == s)
            .ok_or_else(|| format!("unknown cache resource: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExerciseFilter {
    Program,
    Discipline,
    Empty,
}

impl ExerciseFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            ExerciseFilter::Program => "program",
            ExerciseFilter::Discipline => "discipline",
            ExerciseFilter::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdviceType {
    Training,
    Rest,
}

impl AdviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            AdviceType::Training => "training",
            AdviceType::Rest => "rest",
        }
    }
}

/// Key inputs for one cached read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceParams {
    ProfileSummary {
        profile_id: String,
    },
    AchievementsPage {
        profile_id: String,
        page: u32,
        page_size: u32,
    },
    ExerciseCatalog {
        profile_id: Option<String>,
        page: u32,
        page_size: u32,
    },
    ExerciseList {
        filter: ExerciseFilter,
        filter_id: Option<String>,
        page: u32,
        page_size: u32,
    },
    DailyAdviceList {
        advice_type: AdviceType,
    },
    Reports {
        profile_id: String,
        slug: String,
        range: String,
    },
    TrainingDisciplines,
    TrainingPrograms {
        discipline_id: Option<String>,
    },
    AssistantNotesPage {
        profile_id: String,
        limit: u32,
        offset: u32,
    },
    AiAdvisorAdvice {
        profile_id: String,
        fingerprint: String,
    },
}

fn or_default<'a>(value: &'a Option<String>, fallback: &'a str) -> &'a str {
    value.as_deref().filter(|v| !v.is_empty()).unwrap_or(fallback)
}

impl ResourceParams {
    pub fn resource(&self) -> CacheResource {
        match self {
            ResourceParams::ProfileSummary { .. } => CacheResource::ProfileSummary,
            ResourceParams::AchievementsPage { .. } => CacheResource::AchievementsPage,
            ResourceParams::ExerciseCatalog { .. } => CacheResource::ExerciseCatalog,
            ResourceParams::ExerciseList { .. } => CacheResource::ExerciseList,
            ResourceParams::DailyAdviceList { .. } => CacheResource::DailyAdviceList,
            ResourceParams::Reports { .. } => CacheResource::Reports,
            ResourceParams::TrainingDisciplines => CacheResource::TrainingDisciplines,
            ResourceParams::TrainingPrograms { .. } => CacheResource::TrainingPrograms,
            ResourceParams::AssistantNotesPage { .. } => CacheResource::AssistantNotesPage,
            ResourceParams::AiAdvisorAdvice { .. } => CacheResource::AiAdvisorAdvice,
        }
    }

    /// Key without version or projection segments.
    pub fn base_key(&self) -> String {
        match self {
            ResourceParams::ProfileSummary { profile_id } => format!("profile:summary:{profile_id}"),
            ResourceParams::AchievementsPage {
                profile_id,
                page,
                page_size,
            } => format!("achievements:{profile_id}:p:{page}:s:{page_size}"),
            ResourceParams::ExerciseCatalog {
                profile_id,
                page,
                page_size,
            } => format!(
                "exercises:catalog:{}:p:{page}:s:{page_size}",
                or_default(profile_id, "public")
            ),
            ResourceParams::ExerciseList {
                filter,
                filter_id,
                page,
                page_size,
            } => format!(
                "exercises:list:{}:{}:p:{page}:s:{page_size}",
                filter.as_str(),
                or_default(filter_id, "all")
            ),
            ResourceParams::DailyAdviceList { advice_type } => {
                format!("daily_advice:list:{}", advice_type.as_str())
            }
            ResourceParams::Reports {
                profile_id,
                slug,
                range,
            } => format!("reports:{profile_id}:{slug}:{range}"),
            ResourceParams::TrainingDisciplines => "training:disciplines:v1".to_string(),
            ResourceParams::TrainingPrograms { discipline_id } => {
                format!("training:programs:{}", or_default(discipline_id, "all"))
            }
            ResourceParams::AssistantNotesPage {
                profile_id,
                limit,
                offset,
            } => format!("assistant:notes:{profile_id}:l{limit}:o{offset}"),
            ResourceParams::AiAdvisorAdvice {
                profile_id,
                fingerprint,
            } => format!("assistant:ai-advice:{profile_id}:{fingerprint}"),
        }
    }

    /// Scope used for version bumps and adaptive TTL tracking. `None` for
    /// unscoped resources and for an empty scope.
    pub fn scope_key(&self) -> Option<String> {
        let scope = match self {
            ResourceParams::AchievementsPage { profile_id, .. }
            | ResourceParams::Reports { profile_id, .. }
            | ResourceParams::AssistantNotesPage { profile_id, .. }
            | ResourceParams::AiAdvisorAdvice { profile_id, .. } => profile_id.clone(),
            ResourceParams::ExerciseCatalog { profile_id, .. } => {
                or_default(profile_id, "public").to_string()
            }
            ResourceParams::ExerciseList {
                filter, filter_id, ..
            } => format!("{}:{}", filter.as_str(), or_default(filter_id, "all")),
            ResourceParams::DailyAdviceList { advice_type } => advice_type.as_str().to_string(),
            ResourceParams::ProfileSummary { .. }
            | ResourceParams::TrainingDisciplines
            | ResourceParams::TrainingPrograms { .. } => return None,
        };
        (!scope.is_empty()).then_some(scope)
    }
}

// ============================================================================
// KEY VERSIONING
// ============================================================================

/// Deploy-time key versions. Raising either one orphans every existing key
/// it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVersioning {
    pub global: u64,
    pub resources: HashMap<CacheResource, u64>,
}

impl Default for CacheVersioning {
    fn default() -> Self {
        Self {
            global: 1,
            resources: HashMap::new(),
        }
    }
}

impl CacheVersioning {
    /// Environment variables:
    /// - `TZONA_CACHE_GLOBAL_VERSION` (default: 1)
    /// - `TZONA_CACHE_RESOURCE_VERSIONS`, e.g. `reports=2,exerciseList=3`
    ///
    /// Unknown resource names and non-positive versions are ignored.
    pub fn from_env() -> Self {
        let global = std::env::var("TZONA_CACHE_GLOBAL_VERSION")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(1);
        let resources = std::env::var("TZONA_CACHE_RESOURCE_VERSIONS")
            .map(|raw| Self::parse_overrides(&raw))
            .unwrap_or_default();
        Self { global, resources }.normalized()
    }

    pub fn parse_overrides(raw: &str) -> HashMap<CacheResource, u64> {
        raw.split(',')
            .filter_map(|pair| {
                let (name, version) = pair.split_once('=')?;
                let resource = name.trim().parse::<CacheResource>().ok()?;
                let version = version.trim().parse::<u64>().ok().filter(|v| *v > 0)?;
                Some((resource, version))
            })
            .collect()
    }

    pub fn with_global(mut self, version: u64) -> Self {
        self.global = version;
        self.normalized()
    }

    pub fn with_resource(mut self, resource: CacheResource, version: u64) -> Self {
        self.resources.insert(resource, version);
        self.normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.global = self.global.max(1);
        self.resources.retain(|_, version| *version > 0);
        self
    }

    pub fn resource_version(&self, resource: CacheResource) -> u64 {
        self.resources.get(&resource).copied().unwrap_or(1)
    }

    /// `:gv{G}` and `:rv{R}` segments, each present only above 1.
    pub fn suffix(&self, resource: CacheResource) -> String {
        let mut suffix = String::new();
        if self.global > 1 {
            suffix.push_str(&format!(":gv{}", self.global));
        }
        let resource_version = self.resource_version(resource);
        if resource_version > 1 {
            suffix.push_str(&format!(":rv{resource_version}"));
        }
        suffix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_keys() {
        let catalog = ResourceParams::ExerciseCatalog {
            profile_id: None,
            page: 1,
            page_size: 20,
        };
        assert_eq!(catalog.base_key(), "exercises:catalog:public:p:1:s:20");
        assert_eq!(catalog.scope_key().as_deref(), Some("public"));

        let list = ResourceParams::ExerciseList {
            filter: ExerciseFilter::Program,
            filter_id: Some(String::new()),
            page: 2,
            page_size: 10,
        };
        assert_eq!(list.base_key(), "exercises:list:program:all:p:2:s:10");
        assert_eq!(list.scope_key().as_deref(), Some("program:all"));

        let notes = ResourceParams::AssistantNotesPage {
            profile_id: "p1".into(),
            limit: 20,
            offset: 40,
        };
        assert_eq!(notes.base_key(), "assistant:notes:p1:l20:o40");

        assert_eq!(
            ResourceParams::TrainingDisciplines.base_key(),
            "training:disciplines:v1"
        );
        assert_eq!(
            ResourceParams::TrainingPrograms { discipline_id: None }.base_key(),
            "training:programs:all"
        );
        assert_eq!(
            ResourceParams::DailyAdviceList {
                advice_type: AdviceType::Rest
            }
            .base_key(),
            "daily_advice:list:rest"
        );
    }

    #[test]
    fn test_unscoped_resources_have_no_scope() {
        let summary = ResourceParams::ProfileSummary {
            profile_id: "p1".into(),
        };
        assert_eq!(summary.scope_key(), None);
        assert!(!summary.resource().is_scoped());

        let reports = ResourceParams::Reports {
            profile_id: String::new(),
            slug: "volume".into(),
            range: "30d".into(),
        };
        assert_eq!(reports.scope_key(), None);
    }

    #[test]
    fn test_resource_names_round_trip() {
        for resource in CacheResource::ALL {
            assert_eq!(resource.name().parse::<CacheResource>(), Ok(resource));
            assert!(resource.base_ttl() >= Duration::from_secs(45));
        }
        assert!("nope".parse::<CacheResource>().is_err());
    }

    #[test]
    fn test_versioning_suffix() {
        let versioning = CacheVersioning::default();
        assert_eq!(versioning.suffix(CacheResource::Reports), "");

        let versioning = versioning
            .with_global(3)
            .with_resource(CacheResource::Reports, 2);
        assert_eq!(versioning.suffix(CacheResource::Reports), ":gv3:rv2");
        assert_eq!(versioning.suffix(CacheResource::ProfileSummary), ":gv3");
    }

    #[test]
    fn test_parse_overrides_skips_invalid_pairs() {
        let parsed = CacheVersioning::parse_overrides("reports=2, exerciseList = 4,bogus=3,profileSummary=0,x");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get(&CacheResource::Reports), Some(&2));
        assert_eq!(parsed.get(&CacheResource::ExerciseList), Some(&4));
    }
}
