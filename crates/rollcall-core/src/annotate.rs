//! Frame annotation: face markers and the cosmetic header overlay.
//!
//! Marker colors follow the original operator conventions: blue for a bare
//! detection, green for a face recognized and marked just now, yellow for an
//! already-marked face, red for an unknown face. Every frame also gets a
//! header band with the system accent and the current date rendered as
//! seven-segment digits.

use crate::processor::{FaceAnnotation, MarkKind};
use chrono::NaiveDate;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

pub const HEADER_HEIGHT: u32 = 24;

const COLOR_DETECTED: Rgb<u8> = Rgb([60, 120, 255]);
const COLOR_RECOGNIZED: Rgb<u8> = Rgb([0, 200, 70]);
const COLOR_ALREADY_MARKED: Rgb<u8> = Rgb([235, 200, 0]);
const COLOR_UNKNOWN: Rgb<u8> = Rgb([225, 45, 45]);
const COLOR_HEADER: Rgb<u8> = Rgb([16, 16, 16]);
const COLOR_ACCENT: Rgb<u8> = Rgb([0, 200, 70]);

fn marker_color(kind: MarkKind) -> Rgb<u8> {
    match kind {
        MarkKind::Detected => COLOR_DETECTED,
        MarkKind::Recognized => COLOR_RECOGNIZED,
        MarkKind::AlreadyMarked => COLOR_ALREADY_MARKED,
        MarkKind::Unknown => COLOR_UNKNOWN,
    }
}

/// Draw all face markers plus the fixed header overlay onto an RGB frame.
pub fn render(image: &mut RgbImage, faces: &[FaceAnnotation], today: NaiveDate) {
    draw_header(image, today);
    for face in faces {
        draw_marker(image, face);
    }
}

fn draw_header(image: &mut RgbImage, today: NaiveDate) {
    let width = image.width();
    if width == 0 || image.height() < HEADER_HEIGHT {
        return;
    }

    draw_filled_rect_mut(
        image,
        Rect::at(0, 0).of_size(width, HEADER_HEIGHT),
        COLOR_HEADER,
    );
    // Accent underline plus the system badge on the left.
    draw_filled_rect_mut(
        image,
        Rect::at(0, HEADER_HEIGHT as i32 - 2).of_size(width, 2),
        COLOR_ACCENT,
    );
    draw_filled_rect_mut(image, Rect::at(6, 5).of_size(12, 12), COLOR_ACCENT);

    let date_text = today.format("%Y-%m-%d").to_string();
    let digits_width = date_text.len() as i32 * (SEG_CELL_W + 2);
    let x = width as i32 - digits_width - 8;
    draw_seven_segment(image, &date_text, x, 5, COLOR_ACCENT);
}

fn draw_marker(image: &mut RgbImage, face: &FaceAnnotation) {
    let color = marker_color(face.kind);
    let r = face.region;
    if r.width < 4 || r.height < 4 {
        return;
    }

    // Two nested hollow rects for a 2px border.
    draw_hollow_rect_mut(
        image,
        Rect::at(r.x as i32, r.y as i32).of_size(r.width, r.height),
        color,
    );
    draw_hollow_rect_mut(
        image,
        Rect::at(r.x as i32 + 1, r.y as i32 + 1).of_size(r.width - 2, r.height - 2),
        color,
    );

    // Status tag above the box.
    let tag_y = r.y as i32 - 7;
    draw_filled_rect_mut(
        image,
        Rect::at(r.x as i32, tag_y.max(0)).of_size(r.width.min(60), 5),
        color,
    );
}

// --- Seven-segment date rendering ---

const SEG_CELL_W: i32 = 8;
const SEG_CELL_H: i32 = 14;

/// Segment bits: 0=top, 1=top-right, 2=bottom-right, 3=bottom,
/// 4=bottom-left, 5=top-left, 6=middle.
const DIGIT_SEGMENTS: [u8; 10] = [
    0b0111111, // 0
    0b0000110, // 1
    0b1011011, // 2
    0b1001111, // 3
    0b1100110, // 4
    0b1101101, // 5
    0b1111101, // 6
    0b0000111, // 7
    0b1111111, // 8
    0b1101111, // 9
];

fn draw_seven_segment(image: &mut RgbImage, text: &str, x: i32, y: i32, color: Rgb<u8>) {
    let mut cursor = x;
    for ch in text.chars() {
        let segments = match ch {
            '0'..='9' => DIGIT_SEGMENTS[ch as usize - '0' as usize],
            '-' => 0b1000000,
            _ => 0,
        };
        draw_digit_cell(image, segments, cursor, y, color);
        cursor += SEG_CELL_W + 2;
    }
}

fn draw_digit_cell(image: &mut RgbImage, segments: u8, x: i32, y: i32, color: Rgb<u8>) {
    let w = SEG_CELL_W as u32;
    let half = SEG_CELL_H / 2;
    let vertical = (half - 1) as u32;

    let bars: [(i32, i32, u32, u32); 7] = [
        (x, y, w, 2),                                     // top
        (x + SEG_CELL_W - 2, y, 2, vertical),             // top-right
        (x + SEG_CELL_W - 2, y + half, 2, vertical),      // bottom-right
        (x, y + SEG_CELL_H - 2, w, 2),                    // bottom
        (x, y + half, 2, vertical),                       // bottom-left
        (x, y, 2, vertical),                              // top-left
        (x, y + half - 1, w, 2),                          // middle
    ];

    for (bit, &(bx, by, bw, bh)) in bars.iter().enumerate() {
        if segments & (1 << bit) != 0 {
            draw_filled_rect_mut(image, Rect::at(bx, by).of_size(bw, bh), color);
        }
    }
}
