use std::sync::Arc;

use psyeval_types::Granularity;

use crate::metric::Metric;
use crate::metrics::{ItemRubric, LabelRubric, Panas, Perspective, RawScale, Rro};
use crate::prompt::PromptLibrary;
use crate::registry::RegistryError;

type BuildFn = fn(&str, Granularity, &PromptLibrary) -> Result<Arc<dyn Metric>, RegistryError>;

/// A metric identity the registry can build from configuration.
pub struct CatalogueEntry {
	pub name: &'static str,
	pub perspective: Perspective,
	pub granularity: Granularity,
	pub summary: &'static str,
	build: BuildFn,
}

impl CatalogueEntry {
	/// Builds the metric, optionally at a different granularity than the default.
	pub fn build(
		&self,
		granularity: Option<Granularity>,
		library: &PromptLibrary,
	) -> Result<Arc<dyn Metric>, RegistryError> {
		(self.build)(self.name, granularity.unwrap_or(self.granularity), library)
	}
}

fn item_rubric(
	name: &str,
	rubric: &str,
	criteria: &[&str],
	(min, max): (f64, f64),
	granularity: Granularity,
	library: &PromptLibrary,
) -> Result<Arc<dyn Metric>, RegistryError> {
	let scale = RawScale::new(min, max);
	Ok(Arc::new(ItemRubric::load(name, rubric, criteria, scale, granularity, library)?))
}

pub const MITI_CRITERIA: [&str; 4] =
	["cultivating change talk", "empathy", "partnership", "softening sustain talk"];

pub const TES_CRITERIA: [&str; 9] = [
	"acceptance of feelings",
	"concern",
	"resonate or capture client feelings",
	"understanding cognitive framework",
	"warmth",
	"understanding feelings",
	"responsiveness",
	"expressiveness",
	"attuned to client's inner world",
];

pub const CTRS_CRITERIA: [&str; 6] = [
	"understanding",
	"interpersonal_effectiveness",
	"collaboration",
	"guided_discovery",
	"focus",
	"strategy",
];

pub const CCT_CRITERIA: [&str; 5] = [
	"current focus",
	"non critical",
	"real connection",
	"self awareness",
	"self exploration",
];

pub const STAGE_ALIGNMENT_LABELS: [&str; 3] = ["aligned", "partially_aligned", "misaligned"];

pub static CATALOGUE: &[CatalogueEntry] = &[
	CatalogueEntry {
		name: "MITI",
		perspective: Perspective::Counselor,
		granularity: Granularity::PerSession,
		summary: "motivational interviewing treatment integrity, 4 criteria, 1-5",
		build: |name, g, lib| item_rubric(name, "miti", &MITI_CRITERIA, (1.0, 5.0), g, lib),
	},
	CatalogueEntry {
		name: "TES",
		perspective: Perspective::Counselor,
		granularity: Granularity::PerSession,
		summary: "therapist empathy scale, 9 criteria, 1-7",
		build: |name, g, lib| item_rubric(name, "tes", &TES_CRITERIA, (1.0, 7.0), g, lib),
	},
	CatalogueEntry {
		name: "CTRS",
		perspective: Perspective::Counselor,
		granularity: Granularity::PerSession,
		summary: "cognitive therapy rating scale, 6 criteria, 0-6",
		build: |name, g, lib| item_rubric(name, "ctrs", &CTRS_CRITERIA, (0.0, 6.0), g, lib),
	},
	CatalogueEntry {
		name: "HTAIS",
		perspective: Perspective::Counselor,
		granularity: Granularity::PerCase,
		summary: "helping alliance inventory, single prompt, 1-5, whole case by default",
		build: |name, g, lib| item_rubric(name, "HTAIS", &["HTAIS"], (1.0, 5.0), g, lib),
	},
	CatalogueEntry {
		name: "CCT",
		perspective: Perspective::Client,
		granularity: Granularity::PerSession,
		summary: "client-centred therapy process, 5 criteria, 0-2",
		build: |name, g, lib| item_rubric(name, "cct", &CCT_CRITERIA, (0.0, 2.0), g, lib),
	},
	CatalogueEntry {
		name: "BDI_II",
		perspective: Perspective::Client,
		granularity: Granularity::PerSession,
		summary: "Beck depression inventory items, 0-3",
		build: |name, g, lib| item_rubric(name, "BDI_II", &["BDI_II"], (0.0, 3.0), g, lib),
	},
	CatalogueEntry {
		name: "PANAS",
		perspective: Perspective::Client,
		granularity: Granularity::PerSession,
		summary: "positive and negative affect, 20 items, 1-5",
		build: |name, g, lib| Ok(Arc::new(Panas::load(name, g, lib)?)),
	},
	CatalogueEntry {
		name: "RRO",
		perspective: Perspective::Dyad,
		granularity: Granularity::PerCase,
		summary: "real relationship realism and genuineness, 24 items, 1-5, whole case by default",
		build: |name, g, lib| Ok(Arc::new(Rro::load(name, g, lib)?)),
	},
	CatalogueEntry {
		name: "stage_alignment",
		perspective: Perspective::Counselor,
		granularity: Granularity::PerSession,
		summary: "whether the session's work fits its stage label",
		build: |name, g, lib| {
			let labels = &STAGE_ALIGNMENT_LABELS;
			Ok(Arc::new(LabelRubric::load(name, "stage_alignment", labels, g, lib)?))
		},
	},
	CatalogueEntry {
		name: "memory_continuity",
		perspective: Perspective::Counselor,
		granularity: Granularity::PerSession,
		summary: "use of earlier sessions' material, 0-10",
		build: |name, g, lib| {
			let criteria = ["memory_continuity"];
			item_rubric(name, "memory_continuity", &criteria, (0.0, 10.0), g, lib)
		},
	},
];

/// Case-insensitive; `-` and `_` are interchangeable.
pub fn lookup(name: &str) -> Option<&'static CatalogueEntry> {
	let wanted = normalize(name);
	CATALOGUE.iter().find(|e| normalize(e.name) == wanted)
}

fn normalize(name: &str) -> String {
	name.trim().to_ascii_lowercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lookup_ignores_case_and_dashes() {
		assert_eq!(lookup("bdi-ii").map(|e| e.name), Some("BDI_II"));
		assert_eq!(lookup("Stage_Alignment").map(|e| e.name), Some("stage_alignment"));
		assert!(lookup("WAI").is_none());
	}

	#[test]
	fn names_are_unique() {
		for (i, a) in CATALOGUE.iter().enumerate() {
			for b in &CATALOGUE[i + 1..] {
				assert_ne!(normalize(a.name), normalize(b.name));
			}
		}
	}

	#[test]
	fn granularity_override_is_applied() {
		let library = PromptLibrary::in_memory([("HTAIS", "HTAIS", "{{diag}}")]);
		let entry = lookup("HTAIS").unwrap();
		let metric = entry.build(Some(Granularity::PerSession), &library).unwrap();
		assert_eq!(metric.granularity(), Granularity::PerSession);
		assert_eq!(metric.name(), "HTAIS");
	}
}
