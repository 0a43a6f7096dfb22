//! Translation/rotation/scale transforms and bounding volumes.

use cgmath::{InnerSpace, Matrix4, Point3, Quaternion, Vector3, VectorSpace};

/// A decomposed affine transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// Translation.
    pub translation: Vector3<f32>,
    /// Rotation (unit quaternion).
    pub rotation: Quaternion<f32>,
    /// Per-axis scale.
    pub scale: Vector3<f32>,
}

impl Transform {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            translation: Vector3::new(0.0, 0.0, 0.0),
            rotation: Quaternion::new(1.0, 0.0, 0.0, 0.0),
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }

    /// A pure translation.
    pub fn from_translation(translation: Vector3<f32>) -> Self {
        Self {
            translation,
            ..Self::identity()
        }
    }

    /// Returns a copy with `rotation` replaced.
    pub fn with_rotation(mut self, rotation: Quaternion<f32>) -> Self {
        self.rotation = rotation;
        self
    }

    /// Returns a copy with a uniform `scale`.
    pub fn with_uniform_scale(mut self, scale: f32) -> Self {
        self.scale = Vector3::new(scale, scale, scale);
        self
    }

    /// The composed matrix `T * R * S`.
    pub fn to_matrix(&self) -> Matrix4<f32> {
        Matrix4::from_translation(self.translation)
            * Matrix4::from(self.rotation)
            * Matrix4::from_nonuniform_scale(self.scale.x, self.scale.y, self.scale.z)
    }

    /// Largest scale factor, used to scale bounding radii.
    pub fn max_scale(&self) -> f32 {
        self.scale.x.abs().max(self.scale.y.abs()).max(self.scale.z.abs())
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

/// Linear interpolation of vectors.
pub fn lerp_vector(from: Vector3<f32>, to: Vector3<f32>, amount: f32) -> Vector3<f32> {
    from.lerp(to, amount)
}

/// Normalized linear interpolation of rotations along the shorter arc.
pub fn nlerp_rotation(from: Quaternion<f32>, to: Quaternion<f32>, amount: f32) -> Quaternion<f32> {
    let to = if from.dot(to) < 0.0 { -to } else { to };
    from.nlerp(to, amount)
}

/// A bounding sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    /// Center.
    pub center: Point3<f32>,
    /// Radius.
    pub radius: f32,
}

impl BoundingSphere {
    /// Smallest sphere around the centroid that contains every point.
    pub fn from_points(points: impl Iterator<Item = Point3<f32>> + Clone) -> Self {
        let (sum, count) = points
            .clone()
            .fold((Vector3::new(0.0, 0.0, 0.0), 0u32), |(sum, count), point| {
                (sum + Vector3::new(point.x, point.y, point.z), count + 1)
            });
        if count == 0 {
            return Self {
                center: Point3::new(0.0, 0.0, 0.0),
                radius: 0.0,
            };
        }

        let centroid = sum / count as f32;
        let center = Point3::new(centroid.x, centroid.y, centroid.z);
        let radius = points
            .map(|point| (point - center).magnitude())
            .fold(0.0f32, f32::max);
        Self { center, radius }
    }

    /// The sphere after applying `transform`.
    pub fn transformed(&self, transform: &Transform) -> Self {
        let center = transform.to_matrix() * self.center.to_homogeneous();
        Self {
            center: Point3::new(center.x, center.y, center.z),
            radius: self.radius * transform.max_scale(),
        }
    }

    /// The sphere after applying an affine world matrix. The radius grows by the
    /// longest basis vector, so the result always encloses the transformed sphere.
    pub fn transformed_by(&self, matrix: &Matrix4<f32>) -> Self {
        let center = *matrix * self.center.to_homogeneous();
        let scale = matrix
            .x
            .truncate()
            .magnitude()
            .max(matrix.y.truncate().magnitude())
            .max(matrix.z.truncate().magnitude());
        Self {
            center: Point3::new(center.x, center.y, center.z),
            radius: self.radius * scale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Deg, Rotation3};

    #[test]
    fn identity_matrix_is_identity() {
        use cgmath::SquareMatrix;
        assert_eq!(Transform::identity().to_matrix(), Matrix4::identity());
    }

    #[test]
    fn nlerp_takes_the_short_arc() {
        let a = Quaternion::from_angle_y(Deg(10.0));
        let b = -Quaternion::from_angle_y(Deg(30.0));
        let halfway = nlerp_rotation(a, b, 0.5);
        let expected = Quaternion::from_angle_y(Deg(20.0));
        assert!(halfway.dot(expected).abs() > 0.9999);
    }

    #[test]
    fn bounding_sphere_follows_translation_and_scale() {
        let sphere = BoundingSphere::from_points(
            [Point3::new(-1.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)].into_iter(),
        );
        assert_eq!(sphere.radius, 1.0);

        let moved = sphere.transformed(
            &Transform::from_translation(Vector3::new(0.0, 5.0, 0.0)).with_uniform_scale(2.0),
        );
        assert_eq!(moved.center, Point3::new(0.0, 5.0, 0.0));
        assert_eq!(moved.radius, 2.0);

        let by_matrix = sphere.transformed_by(
            &Transform::from_translation(Vector3::new(0.0, 5.0, 0.0))
                .with_uniform_scale(2.0)
                .to_matrix(),
        );
        assert_eq!(by_matrix, moved);
    }
}
