use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use super::error::ImageError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub pos: Point,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            pos: Point { x, y },
            width,
            height,
        }
    }

    /// Iterates every pixel coordinate in row-major order.
    pub fn points(&self) -> impl Iterator<Item = Point> {
        let Rect { pos, width, height } = *self;
        (pos.y..pos.y + height).flat_map(move |y| (pos.x..pos.x + width).map(move |x| Point { x, y }))
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Circle {
    pub centre: Point,
    pub radius: u32,
}

impl Circle {
    pub fn new(x: u32, y: u32, radius: u32) -> Self {
        Self {
            centre: Point { x, y },
            radius,
        }
    }
}

#[enum_dispatch]
pub trait Region {
    /// Smallest rectangle covering the region, `None` if it reaches below zero.
    fn bounding_box(&self) -> Option<Rect>;

    fn contains(&self, point: Point) -> bool;

    fn fits_within(&self, width: u32, height: u32) -> bool {
        let Some(bbox) = self.bounding_box() else {
            return false;
        };
        let right = bbox.pos.x.checked_add(bbox.width);
        let bottom = bbox.pos.y.checked_add(bbox.height);
        bbox.width > 0
            && bbox.height > 0
            && matches!(right, Some(r) if r <= width)
            && matches!(bottom, Some(b) if b <= height)
    }
}

impl Region for Rect {
    fn bounding_box(&self) -> Option<Rect> {
        Some(*self)
    }

    fn contains(&self, point: Point) -> bool {
        point.x >= self.pos.x
            && point.y >= self.pos.y
            && (point.x - self.pos.x) < self.width
            && (point.y - self.pos.y) < self.height
    }
}

impl Region for Circle {
    fn bounding_box(&self) -> Option<Rect> {
        let x = self.centre.x.checked_sub(self.radius)?;
        let y = self.centre.y.checked_sub(self.radius)?;
        let side = self.radius.checked_mul(2)?.checked_add(1)?;
        Some(Rect::new(x, y, side, side))
    }

    fn contains(&self, point: Point) -> bool {
        let dx = point.x as i64 - self.centre.x as i64;
        let dy = point.y as i64 - self.centre.y as i64;
        let r = self.radius as i64;
        dx * dx + dy * dy <= r * r
    }
}

#[enum_dispatch(Region)]
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Roi {
    Rect,
    Circle,
}

impl Roi {
    /// Checks the region against a `width`x`height` grid and returns its bounding box.
    pub fn validate(&self, width: u32, height: u32) -> Result<Rect, ImageError> {
        match self.bounding_box() {
            Some(bbox) if self.fits_within(width, height) => Ok(bbox),
            _ => Err(ImageError::InvalidRoi {
                roi: *self,
                width,
                height,
            }),
        }
    }
}
