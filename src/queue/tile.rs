//! Tile descriptor parsing and cursor rectangles.
//!
//! Tile requests arrive as space-separated `key=value` text:
//!
//! ```text
//! tile part=0 width=256 height=256 tileposx=3840 tileposy=0 tilewidth=3840 tileheight=3840 ver=7
//! tilecombine part=0 width=256 height=256 tileposx=0,3840 tileposy=0 tilewidth=3840 tileheight=3840
//! ```
//!
//! A `tilecombine` message carries comma-separated position lists; its
//! descriptor covers the bounding box of all listed positions, which is what
//! cursor-proximity checks need.

// Rust guideline compliant 2026-02

use anyhow::{bail, Context, Result};

/// A view's cursor rectangle in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPosition {
    /// Left edge.
    pub x: i64,
    /// Top edge.
    pub y: i64,
    /// Rectangle width.
    pub width: i64,
    /// Rectangle height.
    pub height: i64,
}

/// A parsed tile request rectangle.
///
/// For `tilecombine` messages the rectangle is the bounding box of every
/// listed position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileDesc {
    part: i64,
    width: i64,
    height: i64,
    tile_pos_x: i64,
    tile_pos_y: i64,
    tile_width: i64,
    tile_height: i64,
    ver: Option<i64>,
    id: Option<String>,
}

impl TileDesc {
    /// Parse a `tile`/`tilecombine` message.
    ///
    /// Unknown parameters (and anything trailing `ver=`) are ignored; absent
    /// geometry fields default to zero. At least one recognized parameter
    /// must be present, and recognized numeric values must parse.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is not tile-prefixed, carries no
    /// recognized parameter, or a recognized numeric value is malformed.
    pub fn parse(text: &str) -> Result<TileDesc> {
        let mut words = text.split_whitespace();
        let kind = words.next().context("empty tile message")?;
        if kind != "tile" && kind != "tilecombine" {
            bail!("not a tile message: [{kind}]");
        }

        let mut part = 0;
        let mut width = 0;
        let mut height = 0;
        let mut pos_x = (0, 0);
        let mut pos_y = (0, 0);
        let mut tile_width = 0;
        let mut tile_height = 0;
        let mut ver = None;
        let mut id = None;
        let mut recognized = 0usize;

        for token in words {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "part" => part = parse_coord(key, value)?,
                "width" => width = parse_coord(key, value)?,
                "height" => height = parse_coord(key, value)?,
                "tileposx" => pos_x = parse_coord_span(key, value)?,
                "tileposy" => pos_y = parse_coord_span(key, value)?,
                "tilewidth" => tile_width = parse_coord(key, value)?,
                "tileheight" => tile_height = parse_coord(key, value)?,
                "ver" => {
                    ver = value.parse().ok();
                }
                "id" => id = Some(value.to_owned()),
                _ => continue,
            }
            recognized += 1;
        }

        if recognized == 0 {
            bail!("no tile parameters in [{text}]");
        }

        Ok(TileDesc {
            part,
            width,
            height,
            tile_pos_x: pos_x.0,
            tile_pos_y: pos_y.0,
            // The span end is the farthest listed position; the rectangle
            // extends one tile beyond it.
            tile_width: (pos_x.1 - pos_x.0) + tile_width,
            tile_height: (pos_y.1 - pos_y.0) + tile_height,
            ver,
            id,
        })
    }

    /// Document part the tile belongs to.
    pub fn part(&self) -> i64 {
        self.part
    }

    /// Rendered tile size in pixels.
    pub fn size(&self) -> (i64, i64) {
        (self.width, self.height)
    }

    /// Version stamp, if the request carried one.
    pub fn version(&self) -> Option<i64> {
        self.ver
    }

    /// Preview identifier (`id=...`), if any.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Whether the tile rectangle touches the given rectangle.
    ///
    /// Edges count as touching, matching how neighbouring tiles share
    /// boundaries in document coordinates.
    pub fn intersects_rect(&self, x: i64, y: i64, width: i64, height: i64) -> bool {
        x + width >= self.tile_pos_x
            && x <= self.tile_pos_x + self.tile_width
            && y + height >= self.tile_pos_y
            && y <= self.tile_pos_y + self.tile_height
    }

    /// Whether the tile rectangle touches a cursor rectangle.
    pub fn intersects_cursor(&self, cursor: &CursorPosition) -> bool {
        self.intersects_rect(cursor.x, cursor.y, cursor.width, cursor.height)
    }
}

fn parse_coord(key: &str, value: &str) -> Result<i64> {
    value
        .parse()
        .with_context(|| format!("malformed {key}=[{value}]"))
}

/// Parse a position that may be a comma-separated list; returns (min, max).
fn parse_coord_span(key: &str, value: &str) -> Result<(i64, i64)> {
    let mut min = i64::MAX;
    let mut max = i64::MIN;
    for item in value.split(',') {
        let coord: i64 = item
            .parse()
            .with_context(|| format!("malformed {key}=[{value}]"))?;
        min = min.min(coord);
        max = max.max(coord);
    }
    Ok((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_tile() {
        let tile = TileDesc::parse(
            "tile part=0 width=256 height=256 tileposx=3840 tileposy=0 tilewidth=3840 tileheight=3840",
        )
        .unwrap();
        assert_eq!(tile.part(), 0);
        assert_eq!(tile.size(), (256, 256));
        assert_eq!(tile.version(), None);
        assert!(tile.id().is_none());
    }

    #[test]
    fn test_parse_keeps_version_and_tolerates_trailing_params() {
        let tile = TileDesc::parse(
            "tile part=2 width=256 height=256 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840 ver=12 imgsize=1234 future=stuff",
        )
        .unwrap();
        assert_eq!(tile.part(), 2);
        assert_eq!(tile.version(), Some(12));
    }

    #[test]
    fn test_parse_preview_id() {
        let tile =
            TileDesc::parse("tile part=0 tileposx=0 tileposy=0 tilewidth=3840 tileheight=3840 id=preview1")
                .unwrap();
        assert_eq!(tile.id(), Some("preview1"));
    }

    #[test]
    fn test_parse_sparse_tile_defaults_geometry() {
        // Requests may omit geometry; missing fields default to zero.
        let tile = TileDesc::parse("tile part=0 tileposx=0 tileposy=0 ver=1").unwrap();
        assert!(tile.intersects_rect(0, 0, 10, 10));
        assert!(!tile.intersects_rect(100, 100, 50, 50));
    }

    #[test]
    fn test_parse_rejects_non_tile() {
        assert!(TileDesc::parse("canceltiles").is_err());
        assert!(TileDesc::parse("key part=0").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_and_parameterless() {
        assert!(TileDesc::parse("").is_err());
        assert!(TileDesc::parse("tile").is_err());
        assert!(TileDesc::parse("tile garbage").is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_number() {
        assert!(TileDesc::parse("tile part=x tileposx=0").is_err());
    }

    #[test]
    fn test_tilecombine_bounding_box() {
        let tile = TileDesc::parse(
            "tilecombine part=0 width=256 height=256 tileposx=0,3840,7680 tileposy=0 tilewidth=3840 tileheight=3840",
        )
        .unwrap();
        // Covers x in [0, 7680 + 3840].
        assert!(tile.intersects_rect(7000, 0, 10, 10));
        assert!(tile.intersects_rect(11520, 0, 10, 10));
        assert!(!tile.intersects_rect(11600, 0, 10, 10));
    }

    #[test]
    fn test_intersects_inclusive_edges() {
        let tile =
            TileDesc::parse("tile part=0 tileposx=100 tileposy=100 tilewidth=100 tileheight=100")
                .unwrap();
        // Rectangle ending exactly at the tile's left edge still touches.
        assert!(tile.intersects_rect(0, 100, 100, 10));
        // Rectangle starting exactly at the tile's right edge still touches.
        assert!(tile.intersects_rect(200, 100, 10, 10));
        assert!(!tile.intersects_rect(201, 100, 10, 10));
        assert!(!tile.intersects_rect(0, 0, 10, 10));
    }

    #[test]
    fn test_intersects_cursor() {
        let tile =
            TileDesc::parse("tile part=0 tileposx=0 tileposy=0 tilewidth=256 tileheight=256")
                .unwrap();
        let near = CursorPosition { x: 100, y: 100, width: 50, height: 50 };
        let far = CursorPosition { x: 1000, y: 1000, width: 50, height: 50 };
        assert!(tile.intersects_cursor(&near));
        assert!(!tile.intersects_cursor(&far));
    }
}
