/// Row-major N-d shape. Activations are laid out `[batch, channels, height, width]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dims = self.dims.iter().map(usize::to_string).collect::<Vec<_>>();
        write!(f, "[{}]", dims.join(" x "))
    }
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        assert!(!dims.is_empty(), "Cannot have a rank 0 shape!");
        assert!(dims.iter().all(|&d| d > 0), "Cannot have a 0-sized dimension in {dims:?}!");
        Self { dims: dims.to_vec() }
    }

    pub fn nchw(batch_size: usize, channels: usize, height: usize, width: usize) -> Self {
        Self::new(&[batch_size, channels, height, width])
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn batch_size(&self) -> usize {
        self.dims[0]
    }

    /// Panics unless this is a 4-d `[n, c, h, w]` shape.
    pub fn as_nchw(&self) -> (usize, usize, usize, usize) {
        assert_eq!(self.rank(), 4, "Expected an NCHW shape, got {self}!");
        (self.dims[0], self.dims[1], self.dims[2], self.dims[3])
    }

    pub fn spatial(&self) -> (usize, usize) {
        let (_, _, h, w) = self.as_nchw();
        (h, w)
    }

    /// Shape after moving `axis` to the front, keeping the order of the rest.
    pub fn with_axis_first(&self, axis: usize) -> Self {
        assert!(axis < self.rank(), "Axis {axis} out of range for {self}!");
        let mut dims = vec![self.dims[axis]];
        dims.extend(self.dims.iter().enumerate().filter(|&(i, _)| i != axis).map(|(_, &d)| d));
        Self { dims }
    }

    /// Interprets the shape as a matrix with `axis` as rows and the
    /// flattened remainder as columns.
    pub fn as_matrix(&self, axis: usize) -> (usize, usize) {
        assert!(self.rank() >= 2, "Cannot view {self} as a matrix!");
        let rows = self.dims[axis];
        (rows, self.size() / rows)
    }
}
