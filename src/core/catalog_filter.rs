use crate::types::{AreaOfInterest, CatalogEntry, SearchFilters};
use geo::{Area, BooleanOps, Polygon};
use std::collections::HashMap;

/// Strict interior overlap between an AOI and a scene footprint. Footprints
/// that merely touch the AOI boundary do not count.
pub fn strictly_intersects(aoi: &Polygon<f64>, footprint: &Polygon<f64>) -> bool {
    aoi.intersection(footprint).unsigned_area() > 0.0
}

/// Apply the attribute and spatial filters to one page of raw catalog
/// entries, in order: inclusive date range, cloud cover, AOI overlap.
pub fn apply_filters(
    entries: Vec<CatalogEntry>,
    filters: &SearchFilters,
    aoi: Option<&AreaOfInterest>,
) -> Vec<CatalogEntry> {
    let before = entries.len();
    let kept: Vec<CatalogEntry> = entries
        .into_iter()
        .filter(|entry| filters.date_range.contains(entry.acquired))
        .filter(|entry| entry.cloud_cover <= filters.cloud_cover_max)
        .filter(|entry| match aoi {
            Some(aoi) => strictly_intersects(&aoi.polygon, &entry.footprint),
            None => true,
        })
        .collect();
    log::debug!("Filtered page: {} of {} entries kept", kept.len(), before);
    kept
}

/// Deduplicate by scene id (latest acquisition wins) and order the result
/// newest-first; ties broken by lower cloud cover, then scene id ascending.
pub fn dedupe_and_order(entries: Vec<CatalogEntry>) -> Vec<CatalogEntry> {
    let mut by_id: HashMap<String, CatalogEntry> = HashMap::new();
    for entry in entries {
        match by_id.get(&entry.scene_id) {
            Some(existing) if existing.acquired >= entry.acquired => {}
            _ => {
                by_id.insert(entry.scene_id.clone(), entry);
            }
        }
    }

    let mut ordered: Vec<CatalogEntry> = by_id.into_values().collect();
    ordered.sort_by(|a, b| {
        b.acquired
            .cmp(&a.acquired)
            .then(a.cloud_cover.total_cmp(&b.cloud_cover))
            .then(a.scene_id.cmp(&b.scene_id))
    });
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetHandle, BandRole, BoundingBox, DateRange};
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn entry(scene_id: &str, day: u32, cloud: f32) -> CatalogEntry {
        let mut bands = HashMap::new();
        bands.insert(BandRole::Red, AssetHandle::new("http://x/red.tif"));
        CatalogEntry {
            scene_id: scene_id.to_string(),
            acquired: Utc.with_ymd_and_hms(2024, 6, day, 3, 0, 0).unwrap(),
            cloud_cover: cloud,
            footprint: BoundingBox::new(110.0, -8.0, 111.0, -7.0).to_polygon(),
            bands,
            visual: None,
            thumbnail: None,
        }
    }

    fn filters(cloud_max: f32) -> SearchFilters {
        SearchFilters {
            date_range: DateRange::new(
                Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 6, 30, 23, 59, 59).unwrap(),
            )
            .unwrap(),
            cloud_cover_max: cloud_max,
        }
    }

    #[test]
    fn test_ordering_newest_first_with_tie_breaks() {
        let entries = vec![
            entry("S2B_003", 10, 5.0),
            entry("S2B_001", 20, 12.0),
            entry("S2B_004", 10, 5.0),
            entry("S2B_002", 10, 2.0),
        ];
        let ordered = dedupe_and_order(entries);
        let ids: Vec<&str> = ordered.iter().map(|e| e.scene_id.as_str()).collect();
        // Newest first; same-day ties by cloud cover, then id
        assert_eq!(ids, vec!["S2B_001", "S2B_002", "S2B_003", "S2B_004"]);
    }

    #[test]
    fn test_dedupe_latest_acquisition_wins() {
        let entries = vec![entry("S2B_001", 5, 8.0), entry("S2B_001", 15, 20.0)];
        let ordered = dedupe_and_order(entries);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].acquired.format("%d").to_string(), "15");
    }

    #[test]
    fn test_cloud_cover_monotonicity() {
        let entries = vec![
            entry("S2B_001", 5, 8.0),
            entry("S2B_002", 6, 18.0),
            entry("S2B_003", 7, 28.0),
        ];
        let strict = apply_filters(entries.clone(), &filters(10.0), None);
        let relaxed = apply_filters(entries, &filters(30.0), None);

        assert!(strict.len() <= relaxed.len());
        for kept in &strict {
            assert!(relaxed.iter().any(|e| e.scene_id == kept.scene_id));
        }
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let entries = vec![entry("S2B_001", 1, 5.0), entry("S2B_002", 30, 5.0)];
        let kept = apply_filters(entries, &filters(50.0), None);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_touching_footprint_is_not_an_intersection() {
        let aoi = BoundingBox::new(0.0, 0.0, 1.0, 1.0).to_polygon();
        // Shares the x = 1.0 edge only
        let touching = BoundingBox::new(1.0, 0.0, 2.0, 1.0).to_polygon();
        let overlapping = BoundingBox::new(0.5, 0.5, 2.0, 2.0).to_polygon();

        assert!(!strictly_intersects(&aoi, &touching));
        assert!(strictly_intersects(&aoi, &overlapping));
    }

    #[test]
    fn test_aoi_filter_drops_disjoint_footprints() {
        let aoi = AreaOfInterest::new(BoundingBox::new(110.2, -7.8, 110.5, -7.5).to_polygon(), 4326);
        let mut outside = entry("S2B_002", 6, 5.0);
        outside.footprint = BoundingBox::new(120.0, -3.0, 121.0, -2.0).to_polygon();

        let kept = apply_filters(
            vec![entry("S2B_001", 5, 5.0), outside],
            &filters(50.0),
            Some(&aoi),
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].scene_id, "S2B_001");
    }
}
