//! Support polygon of a skeleton standing on its support points.

use na::{Vector2, Vector3};

/// Convex hull of the support points projected onto the ground plane.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SupportGeometry {
    /// Hull vertices in ground plane coordinates, counter-clockwise.
    pub polygon: Vec<Vector2<f64>>,
    /// `(body, point)` index of each hull vertex.
    pub indices: Vec<(usize, usize)>,
    /// World space directions of the two ground plane coordinates.
    pub axes: (Vector3<f64>, Vector3<f64>),
    /// Area centroid of the polygon in ground plane coordinates.
    pub centroid: Vector2<f64>,
}

/// Ground plane axes for the given gravity. The plane normal points against gravity,
/// or along `z` without gravity.
pub fn support_axes(gravity: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let up = if gravity.norm() > 0.0 {
        -gravity.normalize()
    } else {
        Vector3::z()
    };
    let reference = if up.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let first = up.cross(&reference).cross(&up).normalize();
    let second = up.cross(&first);
    (first, second)
}

/// Compute the support geometry of world space support `points` labelled by `ids`.
pub fn compute_support_geometry(
    points: &[Vector3<f64>],
    ids: &[(usize, usize)],
    gravity: &Vector3<f64>,
) -> SupportGeometry {
    let axes = support_axes(gravity);
    let projected: Vec<Vector2<f64>> = points
        .iter()
        .map(|p| Vector2::new(p.dot(&axes.0), p.dot(&axes.1)))
        .collect();
    let hull = convex_hull(&projected);
    let polygon: Vec<_> = hull.iter().map(|&i| projected[i]).collect();
    let indices = hull.iter().map(|&i| ids[i]).collect();
    let centroid = polygon_centroid(&polygon);
    SupportGeometry {
        polygon,
        indices,
        axes,
        centroid,
    }
}

fn cross(o: &Vector2<f64>, a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Monotone chain convex hull. Returns counter-clockwise indices into `points`
/// without collinear vertices.
pub fn convex_hull(points: &[Vector2<f64>]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| {
        points[a]
            .x
            .total_cmp(&points[b].x)
            .then(points[a].y.total_cmp(&points[b].y))
    });
    order.dedup_by(|a, b| points[*a] == points[*b]);
    if order.len() < 3 {
        return order;
    }

    let mut hull: Vec<usize> = Vec::with_capacity(2 * order.len());
    for pass in 0..2 {
        let start = hull.len();
        let iter: Box<dyn Iterator<Item = &usize>> = if pass == 0 {
            Box::new(order.iter())
        } else {
            Box::new(order.iter().rev())
        };
        for &i in iter {
            while hull.len() >= start + 2
                && cross(
                    &points[hull[hull.len() - 2]],
                    &points[hull[hull.len() - 1]],
                    &points[i],
                ) <= 0.0
            {
                hull.pop();
            }
            hull.push(i);
        }
        // The last point of each chain starts the next one.
        hull.pop();
    }
    hull
}

/// Area centroid, falling back to the vertex average for degenerate polygons.
pub fn polygon_centroid(polygon: &[Vector2<f64>]) -> Vector2<f64> {
    if polygon.is_empty() {
        return Vector2::zeros();
    }
    let mut area = 0.0;
    let mut weighted = Vector2::zeros();
    for (i, a) in polygon.iter().enumerate() {
        let b = &polygon[(i + 1) % polygon.len()];
        let c = a.x * b.y - b.x * a.y;
        area += c;
        weighted += (a + b) * c;
    }
    if area.abs() > 1e-12 {
        weighted / (3.0 * area)
    } else {
        polygon.iter().sum::<Vector2<f64>>() / polygon.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::*;

    #[test]
    fn hull_of_square_with_interior_point() {
        let points = vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 1.0),
            Vector2::new(0.5, 0.5),
            Vector2::new(1.0, 0.0),
            Vector2::new(0.0, 1.0),
            Vector2::new(0.5, 0.0),
        ];
        let hull = convex_hull(&points);
        assert_eq!(hull, vec![0, 3, 1, 4]);
        let polygon: Vec<_> = hull.iter().map(|&i| points[i]).collect();
        assert_relative_eq!(polygon_centroid(&polygon), Vector2::new(0.5, 0.5));
    }

    #[test]
    fn degenerate_hulls() {
        assert!(convex_hull(&[]).is_empty());
        let collinear = vec![Vector2::new(0.0, 0.0), Vector2::new(2.0, 0.0)];
        assert_eq!(convex_hull(&collinear).len(), 2);
        assert_relative_eq!(polygon_centroid(&collinear), Vector2::new(1.0, 0.0));
    }

    #[test]
    fn axes_are_orthonormal_and_horizontal() {
        for gravity in [
            Vector3::new(0.0, 0.0, -9.81),
            Vector3::new(0.0, -9.81, 0.0),
            Vector3::new(-9.81, 0.0, 0.0),
            Vector3::zeros(),
        ] {
            let (a, b) = support_axes(&gravity);
            assert_relative_eq!(a.norm(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(b.norm(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(a.dot(&b), 0.0, epsilon = 1e-12);
            assert_relative_eq!(a.dot(&gravity), 0.0, epsilon = 1e-12);
            assert_relative_eq!(b.dot(&gravity), 0.0, epsilon = 1e-12);
        }
    }
}
