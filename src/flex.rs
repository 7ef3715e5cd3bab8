use crate::models::{ContainerLayout, Layer, Position, Size};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Row,
    Column,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Justify {
    FlexStart,
    Center,
    FlexEnd,
    SpaceBetween,
    SpaceAround,
    SpaceEvenly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    FlexStart,
    Center,
    FlexEnd,
}

#[derive(Debug, Clone, Copy)]
pub struct FlexLayout {
    pub direction: Direction,
    pub justify: Justify,
    pub align: Align,
    pub gap: f64,
}

impl FlexLayout {
    /// Default container layout when a template omits the descriptor:
    /// vertical stack from the top.
    pub fn stacked() -> Self {
        Self {
            direction: Direction::Column,
            justify: Justify::FlexStart,
            align: Align::FlexStart,
            gap: 0.0,
        }
    }

    pub fn from_descriptor(layout: &ContainerLayout) -> Self {
        let direction = match layout.flex_direction.as_str() {
            "row" => Direction::Row,
            _ => Direction::Column,
        };
        let justify = match layout.justify_content.as_str() {
            "center" => Justify::Center,
            "flex-end" => Justify::FlexEnd,
            "space-between" => Justify::SpaceBetween,
            "space-around" => Justify::SpaceAround,
            "space-evenly" => Justify::SpaceEvenly,
            _ => Justify::FlexStart,
        };
        let align = match layout.align_items.as_str() {
            "center" => Align::Center,
            "flex-end" => Align::FlexEnd,
            _ => Align::FlexStart,
        };
        Self {
            direction,
            justify,
            align,
            gap: layout.flex_gap,
        }
    }
}

/// Compute per-child offsets relative to the container's top-left.
/// Children are laid out in input order; negative offsets are allowed and
/// propagate (overflow is the template's responsibility).
pub fn child_positions(container: Size, children: &[Layer], layout: FlexLayout) -> Vec<Position> {
    let count = children.len();
    if count == 0 {
        return Vec::new();
    }
    let is_row = layout.direction == Direction::Row;
    let main = if is_row {
        container.width
    } else {
        container.height
    };
    let cross = if is_row {
        container.height
    } else {
        container.width
    };
    let gap = layout.gap;

    let child_main = |child: &Layer| {
        if is_row {
            child.size.width
        } else {
            child.size.height
        }
    };
    let child_cross = |child: &Layer| {
        if is_row {
            child.size.height
        } else {
            child.size.width
        }
    };

    let total: f64 =
        children.iter().map(child_main).sum::<f64>() + gap * (count as f64 - 1.0);

    // space-between with one child degenerates to flex-start.
    let justify = if count == 1 && layout.justify == Justify::SpaceBetween {
        Justify::FlexStart
    } else {
        layout.justify
    };

    // `lead` is the first child's main offset; `between` the advance added
    // between consecutive children on top of their own extent.
    let (lead, between) = match justify {
        Justify::FlexStart => (0.0, gap),
        Justify::Center => ((main - total) / 2.0, gap),
        Justify::FlexEnd => (main - total, gap),
        Justify::SpaceBetween => {
            let spacing = (main - total + gap * (count as f64 - 1.0)) / (count as f64 - 1.0);
            (0.0, spacing)
        }
        Justify::SpaceAround => {
            let edge = (main - total + gap * (count as f64 - 1.0)) / (2.0 * count as f64);
            (edge, 2.0 * edge + gap)
        }
        Justify::SpaceEvenly => {
            // Child starts sit at even fractions of the main axis.
            let slot = (main - gap * (count as f64 - 1.0)) / (count as f64 + 1.0);
            (slot, 0.0)
        }
    };

    let cross_offset = |child: &Layer| match layout.align {
        Align::FlexStart => 0.0,
        Align::Center => (cross - child_cross(child)) / 2.0,
        Align::FlexEnd => cross - child_cross(child),
    };

    let mut positions = Vec::with_capacity(count);
    if justify == Justify::SpaceEvenly {
        let slot = lead;
        for (index, child) in children.iter().enumerate() {
            let main_pos = slot * (index as f64 + 1.0) + gap * index as f64;
            positions.push(axis_position(is_row, main_pos, cross_offset(child)));
        }
        return positions;
    }

    let mut cursor = lead;
    for child in children {
        positions.push(axis_position(is_row, cursor, cross_offset(child)));
        cursor += child_main(child) + between;
    }
    positions
}

fn axis_position(is_row: bool, main: f64, cross: f64) -> Position {
    if is_row {
        Position { x: main, y: cross }
    } else {
        Position { x: cross, y: main }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(width: f64, height: f64) -> Layer {
        Layer {
            size: Size { width, height },
            ..Default::default()
        }
    }

    fn row_layout(justify: Justify, gap: f64) -> FlexLayout {
        FlexLayout {
            direction: Direction::Row,
            justify,
            align: Align::FlexStart,
            gap,
        }
    }

    fn xs(container: Size, children: &[Layer], layout: FlexLayout) -> Vec<f64> {
        child_positions(container, children, layout)
            .into_iter()
            .map(|pos| pos.x)
            .collect()
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 0.01, "got {actual:?}, want {expected:?}");
        }
    }

    const CONTAINER: Size = Size {
        width: 100.0,
        height: 100.0,
    };

    fn three_children() -> Vec<Layer> {
        vec![child(20.0, 20.0), child(20.0, 20.0), child(20.0, 20.0)]
    }

    #[test]
    fn row_flex_start() {
        let got = xs(CONTAINER, &three_children(), row_layout(Justify::FlexStart, 0.0));
        assert_close(&got, &[0.0, 20.0, 40.0]);
    }

    #[test]
    fn row_center() {
        let got = xs(CONTAINER, &three_children(), row_layout(Justify::Center, 0.0));
        assert_close(&got, &[20.0, 40.0, 60.0]);
    }

    #[test]
    fn row_flex_end() {
        let got = xs(CONTAINER, &three_children(), row_layout(Justify::FlexEnd, 0.0));
        assert_close(&got, &[40.0, 60.0, 80.0]);
    }

    #[test]
    fn row_space_between() {
        let got = xs(
            CONTAINER,
            &three_children(),
            row_layout(Justify::SpaceBetween, 0.0),
        );
        assert_close(&got, &[0.0, 40.0, 80.0]);
    }

    #[test]
    fn row_space_around() {
        let got = xs(
            CONTAINER,
            &three_children(),
            row_layout(Justify::SpaceAround, 0.0),
        );
        assert_close(&got, &[6.667, 40.0, 73.333]);
    }

    #[test]
    fn row_space_evenly() {
        let got = xs(
            CONTAINER,
            &three_children(),
            row_layout(Justify::SpaceEvenly, 0.0),
        );
        assert_close(&got, &[25.0, 50.0, 75.0]);
    }

    #[test]
    fn space_between_single_child_degenerates() {
        let got = xs(
            CONTAINER,
            &[child(20.0, 20.0)],
            row_layout(Justify::SpaceBetween, 0.0),
        );
        assert_close(&got, &[0.0]);
    }

    #[test]
    fn gap_applies_between_children() {
        let got = xs(CONTAINER, &three_children(), row_layout(Justify::FlexStart, 5.0));
        assert_close(&got, &[0.0, 25.0, 50.0]);
    }

    #[test]
    fn cross_axis_center() {
        let layout = FlexLayout {
            direction: Direction::Row,
            justify: Justify::SpaceEvenly,
            align: Align::Center,
            gap: 0.0,
        };
        let positions = child_positions(CONTAINER, &three_children(), layout);
        for pos in &positions {
            assert!((pos.y - 40.0).abs() < 0.01);
        }
        let got: Vec<f64> = positions.iter().map(|pos| pos.x).collect();
        assert_close(&got, &[25.0, 50.0, 75.0]);
    }

    #[test]
    fn column_stacks_vertically() {
        let got = child_positions(CONTAINER, &three_children(), FlexLayout::stacked());
        let ys: Vec<f64> = got.iter().map(|pos| pos.y).collect();
        assert_close(&ys, &[0.0, 20.0, 40.0]);
        assert!(got.iter().all(|pos| pos.x == 0.0));
    }

    #[test]
    fn overflow_goes_negative() {
        let wide = vec![child(60.0, 10.0), child(60.0, 10.0)];
        let got = xs(CONTAINER, &wide, row_layout(Justify::Center, 0.0));
        assert_close(&got, &[-10.0, 50.0]);
    }

    #[test]
    fn descriptor_parsing() {
        let descriptor = ContainerLayout {
            kind: "flex".to_string(),
            flex_direction: "row".to_string(),
            justify_content: "space-evenly".to_string(),
            align_items: "center".to_string(),
            flex_gap: 2.0,
            flex_wrap: String::new(),
        };
        let layout = FlexLayout::from_descriptor(&descriptor);
        assert_eq!(layout.direction, Direction::Row);
        assert_eq!(layout.justify, Justify::SpaceEvenly);
        assert_eq!(layout.align, Align::Center);
        assert_eq!(layout.gap, 2.0);
    }
}
