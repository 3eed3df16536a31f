//! Playback map: the JSON contract that lets a host application sync a
//! cursor against rendered SVG and generated audio. Geometry comes from
//! the layout, timing from the unrolled timeline; both reference measures
//! by the same indices used in the SVG group ids.

use serde::Serialize;

use crate::layout::ScoreLayout;
use crate::timeline::TimelineEntry;

#[derive(Debug, Clone, Serialize)]
pub struct PlaybackMap {
    pub measures: Vec<MeasureRef>,
    pub systems: Vec<SystemRef>,
    pub timeline: Vec<TimelineRef>,
    /// Total playback length in milliseconds, repeats included.
    pub duration_ms: f64,
}

/// Where measure `index` sits on the page.
#[derive(Debug, Clone, Serialize)]
pub struct MeasureRef {
    pub index: usize,
    pub system: usize,
    pub x: f64,
    pub y: f64,
    pub width: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemRef {
    pub index: usize,
    pub page: usize,
    pub y: f64,
}

/// One cursor stop: play-order time plus page coordinates.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineRef {
    pub time_ms: f64,
    pub measure: usize,
    pub pass: u32,
    pub x: f64,
    pub y: f64,
}

impl PlaybackMap {
    pub fn build(
        layout: &ScoreLayout,
        timeline: &[TimelineEntry],
        duration_ms: f64,
    ) -> PlaybackMap {
        let measures = layout
            .measures
            .iter()
            .map(|m| MeasureRef {
                index: m.index,
                system: m.system,
                x: m.x,
                y: layout.systems[m.system].y,
                width: m.width,
            })
            .collect();
        let systems = layout
            .systems
            .iter()
            .map(|s| SystemRef { index: s.index, page: s.page, y: s.y })
            .collect();
        let timeline = timeline
            .iter()
            .map(|e| TimelineRef {
                time_ms: e.time_ms,
                measure: e.measure,
                pass: e.pass,
                x: e.x,
                y: e.y,
            })
            .collect();
        PlaybackMap { measures, systems, timeline, duration_ms }
    }

    /// Compact JSON, stable field order.
    pub fn to_json(&self) -> String {
        // Serialization of these plain structs cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::compute_layout;
    use crate::model::build_score;
    use crate::parse::parse_xml;
    use crate::timeline::{build_timeline, total_duration_ms, unroll};

    const SIMPLE: &str = r#"<?xml version="1.0"?>
<score-partwise version="4.0">
  <part-list><score-part id="P1"><part-name>Lead</part-name></score-part></part-list>
  <part id="P1">
    <measure number="1">
      <attributes><divisions>1</divisions>
        <time><beats>4</beats><beat-type>4</beat-type></time></attributes>
      <note><pitch><step>C</step><octave>4</octave></pitch><duration>1</duration></note>
      <note><pitch><step>D</step><octave>4</octave></pitch><duration>1</duration></note>
      <note><pitch><step>E</step><octave>4</octave></pitch><duration>1</duration></note>
      <note><pitch><step>F</step><octave>4</octave></pitch><duration>1</duration></note>
    </measure>
    <measure number="2">
      <note><rest/><duration>4</duration></note>
    </measure>
  </part>
</score-partwise>"#;

    fn map_for(xml: &str) -> PlaybackMap {
        let score = build_score(&parse_xml(xml).unwrap()).unwrap();
        let layout = compute_layout(&score, 820.0).unwrap();
        let unrolled = unroll(&score).unwrap();
        let timeline = build_timeline(&score, &layout, &unrolled);
        PlaybackMap::build(&layout, &timeline, total_duration_ms(&unrolled))
    }

    #[test]
    fn map_covers_all_measures() {
        let map = map_for(SIMPLE);
        assert_eq!(map.measures.len(), 2);
        assert_eq!(map.measures[0].index, 0);
        assert_eq!(map.measures[1].index, 1);
        assert_eq!(map.systems.len(), 1);
        assert_eq!(map.systems[0].page, 0);
    }

    #[test]
    fn timeline_matches_quarter_grid() {
        let map = map_for(SIMPLE);
        let first_measure: Vec<f64> = map
            .timeline
            .iter()
            .filter(|e| e.measure == 0)
            .map(|e| e.time_ms)
            .collect();
        assert_eq!(first_measure, vec![0.0, 500.0, 1000.0, 1500.0]);
    }

    #[test]
    fn duration_covers_both_measures() {
        // Two 4/4 measures at the 120 bpm default: 2000 ms each.
        let map = map_for(SIMPLE);
        assert_eq!(map.duration_ms, 4000.0);
        assert!(map.timeline.iter().all(|e| e.time_ms < map.duration_ms));
    }

    #[test]
    fn json_shape_is_stable() {
        let map = map_for(SIMPLE);
        let json = map.to_json();
        assert!(json.starts_with(r#"{"measures":[{"index":0,"#));
        assert!(json.contains(r#""systems":[{"index":0,"page":0,"#));
        assert!(json.contains(r#""timeline":[{"time_ms":0.0,"measure":0,"pass":1,"#));
    }

    #[test]
    fn json_is_deterministic() {
        assert_eq!(map_for(SIMPLE).to_json(), map_for(SIMPLE).to_json());
    }

    #[test]
    fn timeline_coordinates_lie_inside_their_measure() {
        let map = map_for(SIMPLE);
        for entry in &map.timeline {
            let m = &map.measures[entry.measure];
            assert!(entry.x >= m.x && entry.x <= m.x + m.width);
            assert_eq!(entry.y, m.y);
        }
    }
}
