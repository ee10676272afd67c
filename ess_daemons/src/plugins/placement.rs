use crate::registry::plugin_settings;
use ess_lib::{Collection, Edge, EssError, EssResult, Request, RequestBroker};
use serde::Deserialize;

/// Which edge wins when several have the same free space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// Earliest in candidate order.
    #[default]
    First,
    /// Latest in candidate order.
    Last,
    /// Smallest edge name.
    Name,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MaxFreeSpaceSettings {
    pub tie_break: TieBreak,
}

/// Places a request on the candidate with the most free space.
#[derive(Debug, Clone, Default)]
pub struct MaxFreeSpaceBroker {
    tie_break: TieBreak,
}

impl MaxFreeSpaceBroker {
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    pub fn from_settings(settings: &toml::Table) -> EssResult<Self> {
        let settings: MaxFreeSpaceSettings = plugin_settings("max_free_space", settings)?;
        Ok(Self::new(settings.tie_break))
    }

    fn better(&self, edge: &Edge, best: &Edge) -> bool {
        let (free, best_free) = (edge.free_space(), best.free_space());
        match self.tie_break {
            TieBreak::First => free > best_free,
            TieBreak::Last => free >= best_free,
            TieBreak::Name => {
                free > best_free || (free == best_free && edge.edge_name < best.edge_name)
            }
        }
    }
}

impl RequestBroker for MaxFreeSpaceBroker {
    fn choose_edge<'a>(
        &self,
        request: &Request,
        _collection: &Collection,
        candidates: &'a [Edge],
    ) -> EssResult<&'a Edge> {
        let mut iter = candidates.iter();
        let mut best = iter.next().ok_or_else(|| {
            EssError::NoSuitableCandidate(format!("request #{}", request.request_id))
        })?;
        for edge in iter {
            if self.better(edge, best) {
                best = edge;
            }
        }
        Ok(best)
    }
}

/// Places a request on the first candidate.
#[derive(Debug, Clone, Default)]
pub struct FirstFitBroker;

impl RequestBroker for FirstFitBroker {
    fn choose_edge<'a>(
        &self,
        request: &Request,
        _collection: &Collection,
        candidates: &'a [Edge],
    ) -> EssResult<&'a Edge> {
        candidates.first().ok_or_else(|| {
            EssError::NoSuitableCandidate(format!("request #{}", request.request_id))
        })
    }
}
